//! Protocol versions of the node-internal endpoints. Both sides of every
//! call carry them: a storage node rejects requests whose version string
//! differs from its own, which catches mixed-release clusters early
//! instead of letting them mis-parse each other's payloads.

pub const DELETE_RUN_TASK_PROTOCOL_VERSION: &str = "v1";
pub const DELETE_STOP_TASK_PROTOCOL_VERSION: &str = "v1";
pub const DELETE_ACTIVE_TASKS_PROTOCOL_VERSION: &str = "v1";
pub const ASYNC_TASKS_PROTOCOL_VERSION: &str = "v1";
