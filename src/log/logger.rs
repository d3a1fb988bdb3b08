//! In-memory logger.

use serde::Serialize;

use crate::core::error::LogError;
use crate::core::job::{Failure, JobId, JobInfo};
use crate::log::registry::LoggerId;
use crate::log::{attempt_name, JobLogger, Ledger, LogRecord};
use crate::util::clock::now_ms;

/// One attempt's log held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Log {
    job_id: JobId,
    name: String,
    attempt: u32,
    data: String,
    started_ms: u128,
    ended_ms: Option<u128>,
    failure: Option<Failure>,
}

impl Log {
    fn new(job: &JobInfo) -> Self {
        Self {
            job_id: job.id,
            name: attempt_name(&job.name, job.attempt),
            attempt: job.attempt,
            data: String::new(),
            started_ms: now_ms(),
            ended_ms: None,
            failure: None,
        }
    }

    /// Job the record belongs to.
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record name, suffixed with `_retryN` for retries.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempt number.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Everything written so far.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Start time in milliseconds since the epoch.
    pub const fn started_ms(&self) -> u128 {
        self.started_ms
    }

    /// End time, once finalized.
    pub const fn ended_ms(&self) -> Option<u128> {
        self.ended_ms
    }

    /// Whether the record was finalized.
    pub const fn has_ended(&self) -> bool {
        self.ended_ms.is_some()
    }

    /// Whether the attempt failed.
    pub const fn has_error(&self) -> bool {
        self.failure.is_some()
    }

    /// The failure, for failed attempts.
    pub const fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }
}

impl LogRecord for Log {
    fn write(&mut self, message: &str) -> Result<(), LogError> {
        self.data.push_str(message);
        Ok(())
    }

    fn aborted(&mut self, failure: &Failure) -> Result<(), LogError> {
        self.data.push_str(&format!("ERROR: {}\n", failure.message));
        self.failure = Some(failure.clone());
        self.ended_ms = Some(now_ms());
        Ok(())
    }

    fn succeeded(&mut self) -> Result<(), LogError> {
        self.ended_ms = Some(now_ms());
        Ok(())
    }
}

/// Keeps every attempt's log in memory.
pub struct Logger {
    id: LoggerId,
    ledger: Ledger<Log>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("id", &self.id)
            .field("records", &self.ledger.n_records())
            .finish()
    }
}

impl Logger {
    /// Create an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: LoggerId::new(),
            ledger: Ledger::new(true),
        }
    }

    /// Every record, finished ones first.
    pub fn get_logs(&self) -> Vec<Log> {
        self.ledger.records()
    }

    /// Finished records of succeeded attempts.
    pub fn get_succeeded_logs(&self) -> Vec<Log> {
        self.ledger
            .closed()
            .into_iter()
            .filter(|log| !log.has_error())
            .collect()
    }

    /// Finished records of failed attempts.
    pub fn get_aborted_logs(&self) -> Vec<Log> {
        self.ledger
            .closed()
            .into_iter()
            .filter(Log::has_error)
            .collect()
    }
}

impl JobLogger for Logger {
    fn id(&self) -> LoggerId {
        self.id
    }

    fn add_log(&self, job: &JobInfo) -> Result<(), LogError> {
        self.ledger.start(job.id, Log::new(job));
        Ok(())
    }

    fn log(&self, job: JobId, message: &str) -> Result<(), LogError> {
        self.ledger.write(job, message)
    }

    fn log_aborted(&self, job: JobId, failure: &Failure) -> Result<(), LogError> {
        self.ledger.abort(job, failure)
    }

    fn log_succeeded(&self, job: JobId) -> Result<(), LogError> {
        self.ledger.succeed(job)
    }

    fn n_started(&self) -> usize {
        self.ledger.n_started()
    }

    fn n_succeeded(&self) -> usize {
        self.ledger.n_succeeded()
    }

    fn n_failed(&self) -> usize {
        self.ledger.n_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: JobId, attempt: u32) -> JobInfo {
        JobInfo {
            id,
            name: "router1".into(),
            attempt,
        }
    }

    #[test]
    fn test_retry_records_are_suffixed() {
        let logger = Logger::new();
        logger.add_log(&info(1, 1)).unwrap();
        logger.log(1, "first try\n").unwrap();
        logger
            .log_aborted(1, &Failure::new("retryable", "timeout"))
            .unwrap();
        logger.add_log(&info(1, 2)).unwrap();
        logger.log(1, "second try\n").unwrap();
        logger.log_succeeded(1).unwrap();

        let logs = logger.get_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].name(), "router1");
        assert_eq!(logs[0].data(), "first try\nERROR: timeout\n");
        assert_eq!(logs[1].name(), "router1_retry1");
        assert!(logs[1].has_ended());
        assert_eq!(logger.n_started(), 2);
        assert_eq!(logger.n_failed(), 1);
        assert_eq!(logger.n_succeeded(), 1);
        assert_eq!(logger.get_aborted_logs().len(), 1);
        assert_eq!(logger.get_succeeded_logs().len(), 1);
    }

    #[test]
    fn test_log_without_record_fails() {
        let logger = Logger::new();
        assert!(matches!(logger.log(9, "x"), Err(LogError::UnknownJob(9))));
        assert!(matches!(
            logger.log_succeeded(9),
            Err(LogError::UnknownJob(9))
        ));
    }
}
