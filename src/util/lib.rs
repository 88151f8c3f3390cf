//! Utility crate for the lumber log-storage engine
#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fs;
pub mod time;
