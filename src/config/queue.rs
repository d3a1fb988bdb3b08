//! Queue configuration.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::log::LogMode;

/// Where job attempts run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One OS thread per attempt.
    #[default]
    Thread,
    /// The Tokio blocking pool.
    Tokio,
}

fn default_max_threads() -> usize {
    num_cpus::get()
}

const fn default_attempts() -> u32 {
    1
}

const fn default_clearmem() -> bool {
    true
}

/// Settings for [`build_queue`](crate::builders::build_queue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs running at once.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Attempts per host job.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Worker backend.
    #[serde(default)]
    pub worker: WorkerMode,
    /// Stack size of worker threads in [`WorkerMode::Thread`].
    #[serde(default)]
    pub thread_stack_size: Option<usize>,
    /// Directory for per-attempt log files. No file logger when unset.
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    /// How existing log files are opened.
    #[serde(default)]
    pub log_mode: LogMode,
    /// Remove the logs of succeeded jobs.
    #[serde(default)]
    pub delete_logs: bool,
    /// Forget finished log records.
    #[serde(default = "default_clearmem")]
    pub clearmem: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            attempts: default_attempts(),
            worker: WorkerMode::default(),
            thread_stack_size: None,
            logdir: None,
            log_mode: LogMode::default(),
            delete_logs: false,
            clearmem: default_clearmem(),
        }
    }
}

impl QueueConfig {
    /// Defaults: one thread per CPU, one attempt, OS-thread workers, no log files.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit.
    #[must_use]
    pub const fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the attempts per host job.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the worker backend.
    #[must_use]
    pub const fn with_worker(mut self, worker: WorkerMode) -> Self {
        self.worker = worker;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// Write per-attempt log files into `logdir`.
    #[must_use]
    pub fn with_logdir(mut self, logdir: impl Into<PathBuf>) -> Self {
        self.logdir = Some(logdir.into());
        self
    }

    /// Set how existing log files are opened.
    #[must_use]
    pub const fn with_log_mode(mut self, mode: LogMode) -> Self {
        self.log_mode = mode;
        self
    }

    /// Remove the logs of succeeded jobs.
    #[must_use]
    pub const fn with_delete_logs(mut self, delete: bool) -> Self {
        self.delete_logs = delete;
        self
    }

    /// Keep or forget finished log records.
    #[must_use]
    pub const fn with_clearmem(mut self, clearmem: bool) -> Self {
        self.clearmem = clearmem;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_threads == 0 {
            return Err("max_threads must be greater than 0".into());
        }
        if self.attempts == 0 {
            return Err("attempts must be greater than 0".into());
        }
        if self.thread_stack_size == Some(0) {
            return Err("thread_stack_size must be greater than 0".into());
        }
        if self.worker == WorkerMode::Tokio && !cfg!(feature = "tokio-runtime") {
            return Err("worker `tokio` requires the `tokio-runtime` feature".into());
        }
        if self.logdir.as_ref().is_some_and(|d| d.as_os_str().is_empty()) {
            return Err("logdir must not be empty".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read `HOSTQUEUE_*` variables, loading a `.env` file first if present, and validate.
    ///
    /// Recognized: `HOSTQUEUE_MAX_THREADS`, `HOSTQUEUE_ATTEMPTS`, `HOSTQUEUE_WORKER`
    /// (`thread` or `tokio`) and `HOSTQUEUE_LOGDIR`. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed variable or validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(value) = var("HOSTQUEUE_MAX_THREADS") {
            cfg.max_threads = value
                .parse()
                .map_err(|e| format!("HOSTQUEUE_MAX_THREADS `{value}`: {e}"))?;
        }
        if let Some(value) = var("HOSTQUEUE_ATTEMPTS") {
            cfg.attempts = value
                .parse()
                .map_err(|e| format!("HOSTQUEUE_ATTEMPTS `{value}`: {e}"))?;
        }
        if let Some(value) = var("HOSTQUEUE_WORKER") {
            cfg.worker = match value.to_ascii_lowercase().as_str() {
                "thread" => WorkerMode::Thread,
                "tokio" => WorkerMode::Tokio,
                other => return Err(format!("HOSTQUEUE_WORKER `{other}`: expected thread or tokio")),
            };
        }
        if let Some(value) = var("HOSTQUEUE_LOGDIR") {
            cfg.logdir = Some(PathBuf::from(value));
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_defaults() {
        let cfg = QueueConfig::from_json_str(r#"{"max_threads": 3}"#).unwrap();
        assert_eq!(cfg.max_threads, 3);
        assert_eq!(cfg.attempts, 1);
        assert_eq!(cfg.worker, WorkerMode::Thread);
        assert_eq!(cfg.log_mode, LogMode::Append);
        assert!(cfg.clearmem);
        assert!(cfg.logdir.is_none());
    }

    #[test]
    fn test_json_full() {
        let cfg = QueueConfig::from_json_str(
            r#"{"max_threads": 2, "attempts": 3, "logdir": "/tmp/hq", "log_mode": "truncate",
                "delete_logs": true, "clearmem": false}"#,
        )
        .unwrap();
        assert_eq!(cfg.attempts, 3);
        assert_eq!(cfg.log_mode, LogMode::Truncate);
        assert!(cfg.delete_logs);
        assert!(!cfg.clearmem);
    }

    #[test]
    fn test_validation_errors() {
        assert!(QueueConfig::new().with_max_threads(0).validate().is_err());
        assert!(QueueConfig::new().with_attempts(0).validate().is_err());
        assert!(QueueConfig::new().with_thread_stack_size(0).validate().is_err());
        assert!(QueueConfig::from_json_str("{").unwrap_err().starts_with("parse error"));
        assert!(QueueConfig::new().validate().is_ok());
    }
}
