//! Build a [`Queue`] from a [`QueueConfig`].

use std::sync::Arc;

use tracing::info;

use crate::config::{QueueConfig, WorkerMode};
use crate::core::error::QueueError;
use crate::core::worker::Spawn;
use crate::log::FileLogger;
use crate::queue::Queue;
use crate::runtime::ThreadSpawner;

/// Worker spawner for `cfg.worker`.
///
/// Tokio workers reuse the ambient runtime when called inside one and otherwise get a small
/// runtime of their own.
///
/// # Errors
///
/// Returns [`QueueError`] if the Tokio runtime cannot be created or the feature is disabled.
pub fn build_spawner(cfg: &QueueConfig) -> Result<Arc<dyn Spawn>, QueueError> {
    match cfg.worker {
        WorkerMode::Thread => Ok(Arc::new(
            cfg.thread_stack_size
                .map_or_else(ThreadSpawner::new, ThreadSpawner::with_stack_size),
        )),
        #[cfg(feature = "tokio-runtime")]
        WorkerMode::Tokio => {
            use crate::runtime::TokioSpawner;
            let spawner = TokioSpawner::current().or_else(|_| TokioSpawner::with_worker_threads(1))?;
            Ok(Arc::new(spawner))
        }
        #[cfg(not(feature = "tokio-runtime"))]
        WorkerMode::Tokio => Err(QueueError::InvalidConfig(
            "worker `tokio` requires the `tokio-runtime` feature".into(),
        )),
    }
}

/// Validate `cfg` and build a queue, with a [`FileLogger`] attached when `logdir` is set.
///
/// # Errors
///
/// Returns [`QueueError::InvalidConfig`] for invalid settings, [`QueueError::Log`] if the log
/// directory cannot be created, or [`QueueError::Spawn`] if workers cannot be set up.
pub fn build_queue(cfg: &QueueConfig) -> Result<Queue, QueueError> {
    cfg.validate().map_err(QueueError::InvalidConfig)?;
    let spawner = build_spawner(cfg)?;
    let queue = Queue::with_spawner(cfg.max_threads, spawner)?.with_attempts(cfg.attempts);
    if let Some(logdir) = &cfg.logdir {
        let logger =
            FileLogger::with_options(logdir, cfg.log_mode, cfg.delete_logs, cfg.clearmem)?;
        queue.add_logger(Arc::new(logger));
    }
    info!(
        max_threads = cfg.max_threads,
        attempts = cfg.attempts,
        worker = ?cfg.worker,
        "queue built from configuration"
    );
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = QueueConfig::new().with_max_threads(0);
        assert!(matches!(build_queue(&cfg), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn test_file_logger_attached() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = QueueConfig::new()
            .with_max_threads(1)
            .with_logdir(dir.path().join("logs"));
        let queue = build_queue(&cfg).unwrap();
        let task = queue
            .run(["r1"], |ctx, _, _| {
                ctx.log("hi\n")?;
                Ok(())
            })
            .unwrap();
        task.wait();
        queue.shutdown(false);
        let content = std::fs::read_to_string(dir.path().join("logs").join("r1.log")).unwrap();
        assert_eq!(content, "hi\n");
    }
}
