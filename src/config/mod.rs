//! Configuration models for the queue, its workers and its log files.

pub mod queue;

pub use queue::{QueueConfig, WorkerMode};
