//! OS thread spawner.

use std::thread;

use crate::core::error::QueueError;
use crate::core::worker::{Spawn, WorkFn, WorkerHandle};

/// Runs every worker on a dedicated OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner {
    stack_size: Option<usize>,
}

impl ThreadSpawner {
    /// Spawner using the platform default stack size.
    #[must_use]
    pub const fn new() -> Self {
        Self { stack_size: None }
    }

    /// Spawner giving each worker a stack of `bytes`.
    #[must_use]
    pub const fn with_stack_size(bytes: usize) -> Self {
        Self {
            stack_size: Some(bytes),
        }
    }
}

impl Spawn for ThreadSpawner {
    fn spawn(&self, name: &str, work: WorkFn) -> Result<WorkerHandle, QueueError> {
        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder
            .spawn(work)
            .map(WorkerHandle::Thread)
            .map_err(|e| QueueError::Spawn(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_worker_runs_and_joins() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = ThreadSpawner::with_stack_size(256 * 1024)
            .spawn("w", Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        assert!(handle.join());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_worker_reports_false() {
        let handle = ThreadSpawner::new()
            .spawn("w", Box::new(|| panic!("worker died")))
            .unwrap();
        assert!(!handle.join());
    }
}
