//! File-backed logger.
//!
//! Layout under the log directory:
//!
//! - `<name>.log` for the first attempt, `<name>_retryN.log` for retries;
//! - `<file>.error` next to a failed attempt's log, holding the formatted failure.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::LogError;
use crate::core::job::{Failure, JobId, JobInfo};
use crate::log::registry::LoggerId;
use crate::log::{attempt_name, JobLogger, Ledger, LogRecord};

/// How an existing log file is treated when a record opens it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Keep existing content and append.
    #[default]
    Append,
    /// Start from an empty file.
    Truncate,
}

/// One attempt's log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logfile {
    job_id: JobId,
    name: String,
    path: PathBuf,
    error_path: PathBuf,
    delete: bool,
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

impl Logfile {
    /// Create (or reopen) the file for `job` under `logdir`.
    ///
    /// A stale `.error` companion from an earlier run is removed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the file cannot be created.
    pub fn open(
        logdir: &Path,
        job: &JobInfo,
        mode: LogMode,
        delete: bool,
    ) -> Result<Self, LogError> {
        let name = attempt_name(&job.name, job.attempt);
        let path = logdir.join(format!("{}.log", file_stem(&name)));
        let error_path = logdir.join(format!("{}.log.error", file_stem(&name)));
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            LogMode::Append => options.append(true),
            LogMode::Truncate => options.write(true).truncate(true),
        };
        options.open(&path)?;
        if error_path.exists() {
            fs::remove_file(&error_path)?;
        }
        Ok(Self {
            job_id: job.id,
            name,
            path,
            error_path,
            delete,
        })
    }

    /// Job the file belongs to.
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the error companion.
    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    fn append(&self, text: &str) -> Result<(), LogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

impl LogRecord for Logfile {
    fn write(&mut self, message: &str) -> Result<(), LogError> {
        self.append(message)
    }

    fn aborted(&mut self, failure: &Failure) -> Result<(), LogError> {
        self.append(&format!("ERROR: {}\n", failure.message))?;
        fs::write(&self.error_path, failure.formatted())?;
        Ok(())
    }

    fn succeeded(&mut self) -> Result<(), LogError> {
        if self.delete && self.path.exists() {
            fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "deleted log of succeeded job");
        }
        Ok(())
    }
}

/// Writes one file per attempt into a directory.
pub struct FileLogger {
    id: LoggerId,
    logdir: PathBuf,
    mode: LogMode,
    delete: bool,
    ledger: Ledger<Logfile>,
}

impl std::fmt::Debug for FileLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLogger")
            .field("id", &self.id)
            .field("logdir", &self.logdir)
            .field("mode", &self.mode)
            .field("delete", &self.delete)
            .finish_non_exhaustive()
    }
}

impl FileLogger {
    /// Log into `logdir`, creating it if needed.
    ///
    /// Defaults: append mode, keep logs of succeeded jobs, drop finished records from memory.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the directory cannot be created.
    pub fn new(logdir: impl Into<PathBuf>) -> Result<Self, LogError> {
        Self::with_options(logdir, LogMode::Append, false, true)
    }

    /// Log into `logdir` with explicit options.
    ///
    /// `delete` removes the files of succeeded attempts; `clearmem` forgets finished records.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the directory cannot be created.
    pub fn with_options(
        logdir: impl Into<PathBuf>,
        mode: LogMode,
        delete: bool,
        clearmem: bool,
    ) -> Result<Self, LogError> {
        let logdir = logdir.into();
        fs::create_dir_all(&logdir)?;
        Ok(Self {
            id: LoggerId::new(),
            logdir,
            mode,
            delete,
            ledger: Ledger::new(!clearmem),
        })
    }

    /// The log directory.
    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    /// Records still held in memory.
    pub fn get_logs(&self) -> Vec<Logfile> {
        self.ledger.records()
    }
}

impl JobLogger for FileLogger {
    fn id(&self) -> LoggerId {
        self.id
    }

    fn add_log(&self, job: &JobInfo) -> Result<(), LogError> {
        if !self.logdir.exists() {
            fs::create_dir_all(&self.logdir)?;
        }
        let file = Logfile::open(&self.logdir, job, self.mode, self.delete)?;
        self.ledger.start(job.id, file);
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
