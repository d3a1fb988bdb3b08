//! Tokio runtime spawner implementation.
//!
//! Job callables block, so workers go to the runtime's blocking pool rather than its async
//! worker threads.

use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::core::error::QueueError;
use crate::core::worker::{Spawn, WorkFn, WorkerHandle};

/// Runs every worker on a Tokio runtime's blocking pool.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: Handle,
    runtime: Option<Arc<Runtime>>,
}

impl std::fmt::Debug for TokioSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioSpawner")
            .field("owns_runtime", &self.runtime.is_some())
            .finish()
    }
}

impl TokioSpawner {
    /// Spawn onto the runtime behind `handle`.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
        }
    }

    /// Spawn onto the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Spawn`] outside a Tokio runtime.
    pub fn current() -> Result<Self, QueueError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| QueueError::Spawn(e.to_string()))
    }

    /// Create and own a multi-threaded runtime with `worker_threads` async workers.
    ///
    /// Must not be dropped from inside an async context.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Spawn`] if the runtime cannot be built.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, QueueError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("hostqueue-tokio")
            .enable_all()
            .build()
            .map_err(|e| QueueError::Spawn(e.to_string()))?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(Arc::new(runtime)),
        })
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, _name: &str, work: WorkFn) -> Result<WorkerHandle, QueueError> {
        let handle = self.handle.spawn_blocking(work);
        Ok(WorkerHandle::Tokio {
            handle,
            runtime: self.handle.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_blocking_work_runs_on_owned_runtime() {
        let spawner = TokioSpawner::with_worker_threads(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hits = Arc::clone(&hits);
                spawner
                    .spawn(
                        "w",
                        Box::new(move || {
                            hits.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .unwrap()
            })
            .collect();
        assert!(handles.into_iter().all(WorkerHandle::join));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_current_outside_runtime_fails() {
        assert!(matches!(TokioSpawner::current(), Err(QueueError::Spawn(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_current_inside_runtime() {
        let spawner = TokioSpawner::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = spawner
            .spawn(
                "w",
                Box::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        // Joining blocks, so it has to happen off the async workers.
        let joined = tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
        assert!(joined);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
