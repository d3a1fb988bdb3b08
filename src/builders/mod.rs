//! Builders turning configuration into a running queue.

pub mod queue_builder;

pub use queue_builder::{build_queue, build_spawner};
