//! Internal HTTP API of a lumber storage node
#[macro_use]
extern crate tracing;

pub mod error;
pub use error::Error;

pub mod metrics;
mod server;

pub use server::InternalApiServer;
