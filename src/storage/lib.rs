//! Core storage crate of lumber: partitions, parts, delete markers and the
//! async-task machinery that applies deletes in the background
#[macro_use]
extern crate tracing;

pub mod bool_rle;
pub mod delete;
pub mod error;
pub mod marker;
pub mod partition;
pub mod task;
pub mod task_info;
pub mod worker;
