//! Jobs, their outcomes and the context a running job sees.
//!
//! A [`Job`] wraps a callable with a name, an attempt budget and an optional payload. Every
//! attempt runs on its own worker and reports exactly one [`Outcome`] back to the supervisor;
//! the retry loop matches on that outcome instead of unwinding.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::account::AccountId;
use crate::account::proxy::AccountProxy;
use crate::core::error::{ProxyError, QueueError};
use crate::core::pipeline::ItemId;
use crate::host::Host;
use crate::infra::pipe::WorkerPipe;
use crate::log::proxy::LoggerProxy;
use crate::log::registry::LoggerId;

/// Identifier of an enqueued job. Shared with the pipeline item id.
pub type JobId = ItemId;

/// The callable a job runs once per attempt.
pub type JobFn = Arc<dyn Fn(&JobContext) -> JobResult + Send + Sync>;

/// Result of one job attempt.
pub type JobResult = Result<(), JobError>;

/// Failure returned by a job callable.
///
/// `?` on an `anyhow::Result` yields a retryable error; use [`JobError::fatal`] for failures
/// that must not be retried.
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the attempt is repeated while the budget allows.
    #[error("{0:#}")]
    Retry(anyhow::Error),
    /// Terminal failure; the job is aborted immediately.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl JobError {
    /// Wrap `err` as a retryable failure.
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self::Retry(err.into())
    }

    /// Wrap `err` as a fatal failure.
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retry(err)
    }
}

impl From<ProxyError> for JobError {
    fn from(err: ProxyError) -> Self {
        Self::Fatal(err.into())
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        Self::Fatal(err.into())
    }
}

/// Text-only description of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure class: `retryable`, `fatal`, `panic`, `disconnected` or `spawn`.
    pub kind: String,
    /// One-line message.
    pub message: String,
    /// Full rendering including the cause chain.
    pub trace: String,
}

impl Failure {
    /// Build a failure without a separate trace.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: kind.into(),
            trace: message.clone(),
            message,
        }
    }

    /// Build a failure from an `anyhow` error, rendering its cause chain as the trace.
    pub fn from_error(kind: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            kind: kind.into(),
            message: format!("{err:#}"),
            trace: format!("{err:?}"),
        }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "job panicked".to_string());
        Self::new("panic", message)
    }

    /// Multi-line rendering written to `.error` files.
    #[must_use]
    pub fn formatted(&self) -> String {
        format!("{}: {}\n\n{}\n", self.kind, self.message, self.trace)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a worker reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The callable returned `Ok`.
    Succeeded,
    /// The callable asked for a retry.
    Retryable(Failure),
    /// The attempt failed for good.
    Fatal(Failure),
}

/// Identity of one job attempt, carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job id.
    pub id: JobId,
    /// Job name.
    pub name: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// Cooperative cancellation signal handed to every attempt.
///
/// The queue fires it on forced shutdown. Jobs blocked on I/O register a hook that unblocks
/// them; jobs doing long computations poll [`CancelToken::is_cancelled`].
#[derive(Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CancelToken {
    /// Create an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run `hook` on cancellation, or right away if it already happened.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Request cancellation and run every registered hook once.
    pub fn cancel(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock();
            self.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

/// A unit of work with a retry budget.
pub struct Job {
    name: String,
    function: JobFn,
    times: u32,
    failures: AtomicU32,
    data: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("times", &self.times)
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Create a job that runs `function` once.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
    {
        Self::from_fn(name, Arc::new(function))
    }

    /// Create a job from a shared callable.
    pub fn from_fn(name: impl Into<String>, function: JobFn) -> Self {
        Self {
            name: name.into(),
            function,
            times: 1,
            failures: AtomicU32::new(0),
            data: None,
        }
    }

    /// Allow up to `times` attempts. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_attempts(mut self, times: u32) -> Self {
        self.times = times.max(1);
        self
    }

    /// Attach a payload readable through [`JobContext::data`].
    #[must_use]
    pub fn with_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    /// Job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of attempts.
    pub const fn times(&self) -> u32 {
        self.times
    }

    /// Number of failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn info(&self, id: JobId, attempt: u32) -> JobInfo {
        JobInfo {
            id,
            name: self.name.clone(),
            attempt,
        }
    }

    pub(crate) fn function(&self) -> JobFn {
        Arc::clone(&self.function)
    }

    pub(crate) fn data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.data.clone()
    }
}

/// Run `function` and turn whatever happens into an [`Outcome`]. Panics become `Fatal`.
pub(crate) fn run_callable(function: &JobFn, ctx: &JobContext) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| function(ctx))) {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(JobError::Retry(err))) => Outcome::Retryable(Failure::from_error("retryable", &err)),
        Ok(Err(JobError::Fatal(err))) => Outcome::Fatal(Failure::from_error("fatal", &err)),
        Err(payload) => Outcome::Fatal(Failure::from_panic(payload.as_ref())),
    }
}

/// Everything a running attempt may use: its identity, its payload, the worker pipe and the
/// cancellation token.
pub struct JobContext {
    info: JobInfo,
    pipe: WorkerPipe,
    data: Option<Arc<dyn Any + Send + Sync>>,
    cancel: Arc<CancelToken>,
    loggers: Vec<LoggerId>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("info", &self.info)
            .field("loggers", &self.loggers)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub(crate) fn new(
        info: JobInfo,
        pipe: WorkerPipe,
        data: Option<Arc<dyn Any + Send + Sync>>,
        cancel: Arc<CancelToken>,
        loggers: Vec<LoggerId>,
    ) -> Self {
        Self {
            info,
            pipe,
            data,
            cancel,
            loggers,
        }
    }

    /// Job id.
    pub const fn id(&self) -> JobId {
        self.info.id
    }

    /// Job name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Attempt number, starting at 1.
    pub const fn attempt(&self) -> u32 {
        self.info.attempt
    }

    /// Identity of this attempt.
    pub const fn info(&self) -> &JobInfo {
        &self.info
    }

    /// The job payload, if it has type `T`.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }

    /// Cancellation token for this attempt.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether the queue asked running jobs to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ids of the loggers registered when the attempt started.
    pub fn loggers(&self) -> &[LoggerId] {
        &self.loggers
    }

    /// Proxy for one logger.
    pub fn logger(&self, id: LoggerId) -> LoggerProxy {
        LoggerProxy::new(self.pipe.clone(), id, self.info.clone())
    }

    /// Append `message` to this attempt's record in every registered logger.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProxyError`] reported by a logger.
    pub fn log(&self, message: &str) -> Result<(), ProxyError> {
        for id in &self.loggers {
            self.logger(*id).log(message)?;
        }
        Ok(())
    }

    /// Acquire an account suited for `host`. The account stays held by this job until it is
    /// released or the job ends.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor could not provide an account.
    pub fn account_for_host(&self, host: &Host) -> Result<AccountProxy, ProxyError> {
        AccountProxy::for_host(self.pipe.clone(), host)
    }

    /// Acquire any account from the default pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor could not provide an account.
    pub fn account(&self) -> Result<AccountProxy, ProxyError> {
        AccountProxy::for_random_account(self.pipe.clone())
    }

    /// Acquire the account with `id`, from whichever pool holds it.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor could not provide the account, for instance
    /// because this job already holds it.
    pub fn account_with_id(&self, id: AccountId) -> Result<AccountProxy, ProxyError> {
        AccountProxy::for_account(self.pipe.clone(), id)
    }

    pub(crate) fn finish(self, outcome: Outcome) {
        self.pipe.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::pipe;
    use std::sync::atomic::AtomicUsize;

    fn context() -> JobContext {
        let (worker, _supervisor) = pipe::duplex();
        JobContext::new(
            JobInfo {
                id: 1,
                name: "job".into(),
                attempt: 1,
            },
            worker,
            Some(Arc::new(42_u32)),
            Arc::new(CancelToken::new()),
            Vec::new(),
        )
    }

    #[test]
    fn test_outcome_classification() {
        let ctx = context();
        let ok: JobFn = Arc::new(|_: &JobContext| -> JobResult { Ok(()) });
        let retry: JobFn =
            Arc::new(|_: &JobContext| -> JobResult { Err(anyhow::anyhow!("timeout").into()) });
        let fatal: JobFn = Arc::new(|_: &JobContext| -> JobResult {
            Err(JobError::fatal(anyhow::anyhow!("bad password")))
        });
        let boom: JobFn = Arc::new(|_: &JobContext| -> JobResult { panic!("boom") });

        assert_eq!(run_callable(&ok, &ctx), Outcome::Succeeded);
        assert!(matches!(run_callable(&retry, &ctx), Outcome::Retryable(f) if f.message == "timeout"));
        assert!(matches!(run_callable(&fatal, &ctx), Outcome::Fatal(f) if f.kind == "fatal"));
        assert!(matches!(
            run_callable(&boom, &ctx),
            Outcome::Fatal(f) if f.kind == "panic" && f.message == "boom"
        ));
    }

    #[test]
    fn test_failure_trace_includes_cause() {
        let err = anyhow::anyhow!("connection refused").context("connecting to router1");
        let failure = Failure::from_error("retryable", &err);
        assert_eq!(failure.message, "connecting to router1: connection refused");
        assert!(failure.trace.contains("Caused by"));
        assert!(failure.formatted().starts_with("retryable: connecting"));
    }

    #[test]
    fn test_context_data_downcast() {
        let ctx = context();
        assert_eq!(ctx.data::<u32>(), Some(&42));
        assert!(ctx.data::<String>().is_none());
    }

    #[test]
    fn test_attempts_at_least_one() {
        let job = Job::new("j", |_| Ok(())).with_attempts(0);
        assert_eq!(job.times(), 1);
    }

    #[test]
    fn test_cancel_runs_hooks_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(token.is_cancelled());
    }
}
