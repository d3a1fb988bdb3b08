//! Error types for scheduler, account and logging operations.

use std::io;

use thiserror::Error;

use crate::core::pipeline::ItemId;

/// Errors produced by the event bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The same callback is already subscribed to this event.
    #[error("callback already connected")]
    AlreadyConnected,
}

/// Usage errors raised by accounts, pools and the account manager.
///
/// These indicate a programming defect in the caller and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    /// Acquisition was attempted on a pool without accounts.
    #[error("account pool is empty")]
    EmptyPool,
    /// The requested account is not a member of the pool.
    #[error("account `{0}` is not in the pool")]
    UnknownAccount(String),
    /// The account was released while not locked.
    #[error("account `{0}` is not locked")]
    NotLocked(String),
    /// The calling thread already holds the account.
    #[error("account `{0}` is already held by the calling thread")]
    AlreadyHeld(String),
    /// The owner token holds no accounts in the pool.
    #[error("owner `{0}` holds no accounts")]
    NoSuchOwner(String),
    /// The account is locked, but not under the releasing owner.
    #[error("account `{account}` is not held by owner `{owner}`")]
    NotHeldBy {
        /// Login name of the account.
        account: String,
        /// Owner that attempted the release.
        owner: String,
    },
    /// The owner's pending acquisitions were aborted.
    #[error("account acquisition for owner `{0}` was aborted")]
    Aborted(String),
}

/// Errors produced by the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The item is not currently running.
    #[error("item {0} is not running")]
    NotRunning(ItemId),
    /// The item is not asleep.
    #[error("item {0} is not sleeping")]
    NotSleeping(ItemId),
}

/// Errors produced by the work queue and its facades.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was shut down without restart.
    #[error("queue has been shut down")]
    ShutDown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    /// Pipeline misuse (sleep/wake).
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Log sink could not be created.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Errors produced by log sinks.
#[derive(Debug, Error)]
pub enum LogError {
    /// No log record was started for the job.
    #[error("no log started for job {0}")]
    UnknownJob(u64),
    /// No logger with this id is registered.
    #[error("no logger registered as {0}")]
    UnknownLogger(String),
    /// Writing a log file failed.
    #[error("log i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by proxies talking over the worker pipe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// The other end of the pipe is gone.
    #[error("worker pipe disconnected")]
    Disconnected,
    /// The supervisor answered with an error.
    #[error("remote {kind} error: {message}")]
    Remote {
        /// Error class reported by the supervisor.
        kind: String,
        /// Rendered error message.
        message: String,
    },
    /// The supervisor answered with a value the proxy did not expect.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
