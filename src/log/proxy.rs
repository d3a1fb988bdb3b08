//! Worker-side handle to a logger living with the supervisor.

use crate::core::error::ProxyError;
use crate::core::job::{Failure, JobInfo};
use crate::infra::pipe::WorkerPipe;
use crate::infra::protocol::Request;
use crate::log::registry::LoggerId;

/// Forwards logger calls for one job attempt over the worker pipe.
#[derive(Debug, Clone)]
pub struct LoggerProxy {
    pipe: WorkerPipe,
    logger: LoggerId,
    job: JobInfo,
}

impl LoggerProxy {
    /// Proxy for `logger`, acting on behalf of `job`.
    pub const fn new(pipe: WorkerPipe, logger: LoggerId, job: JobInfo) -> Self {
        Self { pipe, logger, job }
    }

    /// Target logger.
    pub const fn logger_id(&self) -> LoggerId {
        self.logger
    }

    /// Open a record for the attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the logger rejected the call or the pipe is closed.
    pub fn add_log(&self) -> Result<(), ProxyError> {
        self.pipe.call_ok(Request::LogAdd {
            logger: self.logger,
            job: self.job.clone(),
        })
    }

    /// Append `message` to the attempt's record.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the logger rejected the call or the pipe is closed.
    pub fn log(&self, message: &str) -> Result<(), ProxyError> {
        self.pipe.call_ok(Request::Log {
            logger: self.logger,
            job: self.job.id,
            message: message.to_string(),
        })
    }

    /// Close the attempt's record as failed.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the logger rejected the call or the pipe is closed.
    pub fn log_aborted(&self, failure: &Failure) -> Result<(), ProxyError> {
        self.pipe.call_ok(Request::LogAborted {
            logger: self.logger,
            job: self.job.id,
            failure: failure.clone(),
        })
    }

    /// Close the attempt's record as succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the logger rejected the call or the pipe is closed.
    pub fn log_succeeded(&self) -> Result<(), ProxyError> {
        self.pipe.call_ok(Request::LogSucceeded {
            logger: self.logger,
            job: self.job.id,
        })
    }
}
