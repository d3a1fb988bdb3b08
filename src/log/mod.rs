//! Job log sinks.
//!
//! A [`JobLogger`] keeps one record per job attempt. The queue drives it from lifecycle
//! events (`started` opens a record, `error` and `succeeded` close it); running jobs append
//! text through a [`LoggerProxy`](proxy::LoggerProxy).

pub mod file;
pub mod logger;
pub mod proxy;
pub mod registry;

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::core::error::LogError;
use crate::core::job::{Failure, JobId, JobInfo};

pub use file::{FileLogger, LogMode, Logfile};
pub use logger::{Log, Logger};
pub use proxy::LoggerProxy;
pub use registry::{LoggerId, LoggerRegistry};

/// A sink receiving per-attempt job logs.
pub trait JobLogger: Send + Sync {
    /// Identity used by proxies and the registry.
    fn id(&self) -> LoggerId;

    /// Open a record for `job`'s current attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the record could not be created.
    fn add_log(&self, job: &JobInfo) -> Result<(), LogError>;

    /// Append `message` to the job's open record.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownJob`] if no record is open for `job`.
    fn log(&self, job: JobId, message: &str) -> Result<(), LogError>;

    /// Close the job's open record as failed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownJob`] if no record is open for `job`.
    fn log_aborted(&self, job: JobId, failure: &Failure) -> Result<(), LogError>;

    /// Close the job's open record as succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownJob`] if no record is open for `job`.
    fn log_succeeded(&self, job: JobId) -> Result<(), LogError>;

    /// Number of records opened.
    fn n_started(&self) -> usize;

    /// Number of records closed as succeeded.
    fn n_succeeded(&self) -> usize;

    /// Number of records closed as failed.
    fn n_failed(&self) -> usize;
}

/// One attempt's log record.
pub trait LogRecord: Send {
    /// Append raw text.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] for file-backed records.
    fn write(&mut self, message: &str) -> Result<(), LogError>;

    /// Finalize as failed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] for file-backed records.
    fn aborted(&mut self, failure: &Failure) -> Result<(), LogError>;

    /// Finalize as succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] for file-backed records.
    fn succeeded(&mut self) -> Result<(), LogError>;
}

/// Record name for an attempt: `name` for the first, `name_retryN` afterwards.
pub fn attempt_name(name: &str, attempt: u32) -> String {
    if attempt > 1 {
        format!("{name}_retry{}", attempt - 1)
    } else {
        name.to_string()
    }
}

struct LedgerState<R> {
    open: HashMap<JobId, R>,
    closed: Vec<R>,
    started: usize,
    succeeded: usize,
    failed: usize,
}

/// Record bookkeeping shared by the logger implementations.
///
/// Each job has at most one open record; closing it moves it to the closed list unless the
/// ledger drops finished records.
pub struct Ledger<R> {
    state: Mutex<LedgerState<R>>,
    keep_closed: bool,
}

impl<R: LogRecord> Ledger<R> {
    /// Create a ledger. With `keep_closed` unset, finished records are dropped.
    #[must_use]
    pub fn new(keep_closed: bool) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                open: HashMap::new(),
                closed: Vec::new(),
                started: 0,
                succeeded: 0,
                failed: 0,
            }),
            keep_closed,
        }
    }

    /// Open `record` for `job`. A record still open for the job is closed as is.
    pub fn start(&self, job: JobId, record: R) {
        let mut st = self.state.lock();
        st.started += 1;
        if let Some(previous) = st.open.insert(job, record) {
            if self.keep_closed {
                st.closed.push(previous);
            }
        }
    }

    /// Append to the job's open record.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownJob`] if nothing is open, or the record's write error.
    pub fn write(&self, job: JobId, message: &str) -> Result<(), LogError> {
        let mut st = self.state.lock();
        st.open
            .get_mut(&job)
            .ok_or(LogError::UnknownJob(job))?
            .write(message)
    }

    /// Close the job's record as failed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownJob`] if nothing is open, or the record's write error.
    pub fn abort(&self, job: JobId, failure: &Failure) -> Result<(), LogError> {
        let mut st = self.state.lock();
        let mut record = st.open.remove(&job).ok_or(LogError::UnknownJob(job))?;
        st.failed += 1;
        let result = record.aborted(failure);
        if self.keep_closed {
            st.closed.push(record);
        }
        result
    }

    /// Close the job's record as succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownJob`] if nothing is open, or the record's write error.
    pub fn succeed(&self, job: JobId) -> Result<(), LogError> {
        let mut st = self.state.lock();
        let mut record = st.open.remove(&job).ok_or(LogError::UnknownJob(job))?;
        st.succeeded += 1;
        let result = record.succeeded();
        if self.keep_closed {
            st.closed.push(record);
        }
        result
    }

    /// Number of records opened.
    pub fn n_started(&self) -> usize {
        self.state.lock().started
    }

    /// Number of records closed as succeeded.
    pub fn n_succeeded(&self) -> usize {
        self.state.lock().succeeded
    }

    /// Number of records closed as failed.
    pub fn n_failed(&self) -> usize {
        self.state.lock().failed
    }

    /// Number of records still in memory.
    pub fn n_records(&self) -> usize {
        let st = self.state.lock();
        st.open.len() + st.closed.len()
    }
}

impl<R: LogRecord + Clone> Ledger<R> {
    /// Closed records followed by open ones.
    pub fn records(&self) -> Vec<R> {
        let st = self.state.lock();
        st.closed.iter().chain(st.open.values()).cloned().collect()
    }

    /// Closed records only.
    pub fn closed(&self) -> Vec<R> {
        self.state.lock().closed.clone()
    }
}
