//! Configuration module for veles.
//!
//! - `Config` - Root configuration container
//! - `Limits` - Network engine tunables

mod parser;
mod types;

pub use parser::load_config;
pub use types::*;
