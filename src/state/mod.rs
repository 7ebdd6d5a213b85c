//! Durable task/change engine.
//!
//! Every operation the daemon performs is a [`Change`] made of [`Task`]s.
//! The graph lives behind [`State`], is checkpointed to a JSON file after
//! every modification, and is driven by the [`TaskRunner`].

mod change;
mod runner;
mod store;
mod task;

pub use change::{reduce_status, Change};
pub use runner::{RunnerConfig, TaskContext, TaskHandler, TaskRunner};
pub use store::{Graph, State, StateGuard};
pub use task::{LogEntry, LogLevel, Status, Task, MAX_TASK_LOG};
