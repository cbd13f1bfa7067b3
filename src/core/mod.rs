//! Core infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `time` - Clock abstraction for retry pauses

pub mod config;
pub mod time;

pub use config::*;
pub use time::*;
