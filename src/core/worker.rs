//! Worker execution primitive.
//!
//! Each job attempt runs on its own worker. A [`Spawn`] implementation decides what a
//! worker is (an OS thread, a slot in the Tokio blocking pool); the supervisor only needs to
//! start it and join it.

use std::thread::JoinHandle;

use crate::core::error::QueueError;

/// Work handed to a spawner. Runs exactly once.
pub type WorkFn = Box<dyn FnOnce() + Send + 'static>;

/// Abstraction over thread- or task-like workers.
pub trait Spawn: Send + Sync {
    /// Start `work` on a new worker called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Spawn`] if the worker could not be started.
    fn spawn(&self, name: &str, work: WorkFn) -> Result<WorkerHandle, QueueError>;
}

/// Handle to a running worker.
#[derive(Debug)]
pub enum WorkerHandle {
    /// A dedicated OS thread.
    Thread(JoinHandle<()>),
    /// A closure on the Tokio blocking pool.
    #[cfg(feature = "tokio-runtime")]
    Tokio {
        /// Join handle of the blocking task.
        handle: tokio::task::JoinHandle<()>,
        /// Runtime the task was spawned on.
        runtime: tokio::runtime::Handle,
    },
}

impl WorkerHandle {
    /// Block until the worker finished. Returns `false` if it panicked.
    ///
    /// Must be called from a plain thread, never from inside an async context.
    pub fn join(self) -> bool {
        match self {
            Self::Thread(handle) => handle.join().is_ok(),
            #[cfg(feature = "tokio-runtime")]
            Self::Tokio { handle, runtime } => runtime.block_on(handle).is_ok(),
        }
    }

    /// Whether the worker has finished.
    pub fn is_finished(&self) -> bool {
        match self {
            Self::Thread(handle) => handle.is_finished(),
            #[cfg(feature = "tokio-runtime")]
            Self::Tokio { handle, .. } => handle.is_finished(),
        }
    }
}
