#![deny(clippy::all)]

pub mod buffer;
pub mod common;
pub mod config;
pub mod net;
pub mod protocol;
pub mod storage;
