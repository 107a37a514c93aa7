//! Skiff Library
//!
//! This crate is for shared code and utilities that are not specific to any executable in the Skiff stack.

pub mod transaction;
pub mod utils;
#[macro_use]
pub mod macros;
pub mod config;
pub mod logging;
pub mod threading;
pub mod tokio_utils;
