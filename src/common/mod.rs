//! Common utilities shared across the codebase.

pub mod error;

pub use error::ConfigError;
