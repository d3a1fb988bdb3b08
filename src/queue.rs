//! Per-host batch API.
//!
//! [`Queue`] ties a [`WorkQueue`] to an [`AccountManager`] and a set of loggers. Each host
//! becomes one job; the job acquires an account suited for its host, hands the credentials to
//! the user function and releases the account afterwards.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostqueue::account::Account;
//! use hostqueue::log::Logger;
//! use hostqueue::queue::Queue;
//!
//! # fn main() -> Result<(), hostqueue::core::QueueError> {
//! let queue = Queue::new(4)?;
//! queue.add_account(Arc::new(Account::new("admin", "secret")));
//! queue.add_logger(Arc::new(Logger::new()));
//!
//! let task = queue.run(["router1", "router2"], |ctx, host, account| {
//!     let user = account.map_or("anonymous", |a| a.name.as_str());
//!     ctx.log(&format!("{user}@{host}\n"))?;
//!     Ok(())
//! })?;
//! task.wait();
//! queue.shutdown(false);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountManager, AccountPool, AccountSnapshot, HostMatch};
use crate::core::error::QueueError;
use crate::core::event::{handler, Handler};
use crate::core::job::{Failure, Job, JobContext, JobId, JobInfo, JobResult};
use crate::core::pipeline::Promotion;
use crate::core::task::Task;
use crate::core::worker::Spawn;
use crate::core::workqueue::WorkQueue;
use crate::host::Host;
use crate::infra::service::Services;
use crate::log::registry::{LoggerId, LoggerRegistry};
use crate::log::JobLogger;
use crate::runtime::ThreadSpawner;

/// User function run once per host attempt.
///
/// Receives the job context, the host and the acquired account, if the queue has accounts.
pub type HostFn =
    Arc<dyn Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync>;

struct AttachedLogger {
    id: LoggerId,
    // Keeps the logger alive; the registry and the handlers only hold weak references.
    _logger: Arc<dyn JobLogger>,
    _on_started: Handler<JobInfo>,
    _on_error: Handler<(JobInfo, Failure)>,
    _on_succeeded: Handler<JobInfo>,
}

#[derive(Default)]
struct Progress {
    total: AtomicUsize,
    completed: AtomicUsize,
}

/// Runs a function against many hosts with bounded concurrency.
pub struct Queue {
    workqueue: WorkQueue,
    accounts: Arc<AccountManager>,
    loggers: Arc<LoggerRegistry>,
    attached: Mutex<Vec<AttachedLogger>>,
    progress: Arc<Progress>,
    _on_finished: (Handler<JobInfo>, Handler<(JobInfo, Failure)>),
    attempts: u32,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("workqueue", &self.workqueue)
            .field("accounts", &self.accounts.n_accounts())
            .field("loggers", &self.attached.lock().len())
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Create a queue running at most `max_threads` hosts at once on OS threads.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if `max_threads` is zero or the dispatcher cannot start.
    pub fn new(max_threads: usize) -> Result<Self, QueueError> {
        Self::with_spawner(max_threads, Arc::new(ThreadSpawner::new()))
    }

    /// Create a queue whose workers come from `spawner`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if `max_threads` is zero or the dispatcher cannot start.
    pub fn with_spawner(max_threads: usize, spawner: Arc<dyn Spawn>) -> Result<Self, QueueError> {
        let accounts = Arc::new(AccountManager::new());
        let loggers = Arc::new(LoggerRegistry::new());
        let services = Services::new(Arc::clone(&accounts), Arc::clone(&loggers));
        let workqueue = WorkQueue::with_spawner(max_threads, spawner, services)?;

        let progress = Arc::new(Progress::default());
        let p = Arc::clone(&progress);
        let on_succeeded = handler(move |_: &JobInfo| {
            p.completed.fetch_add(1, Ordering::AcqRel);
            None
        });
        let p = Arc::clone(&progress);
        let on_aborted = handler(move |_: &(JobInfo, Failure)| {
            p.completed.fetch_add(1, Ordering::AcqRel);
            None
        });
        let events = workqueue.events();
        let _ = events.job_succeeded.listen(&on_succeeded);
        let _ = events.job_aborted.listen(&on_aborted);

        Ok(Self {
            workqueue,
            accounts,
            loggers,
            attached: Mutex::new(Vec::new()),
            progress,
            _on_finished: (on_succeeded, on_aborted),
            attempts: 1,
        })
    }

    /// Give every job created by the `run` family up to `attempts` attempts.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// The underlying scheduler.
    pub const fn workqueue(&self) -> &WorkQueue {
        &self.workqueue
    }

    /// The account manager jobs acquire from.
    pub const fn account_manager(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    /// Add `account` to the default pool.
    pub fn add_account(&self, account: Arc<Account>) {
        self.accounts.add_account(account);
    }

    /// Add a pool serving the hosts `matches` accepts. Without a predicate, `pool` replaces
    /// the default pool and the accounts added so far with [`Queue::add_account`].
    pub fn add_account_pool(&self, pool: AccountPool, matches: Option<HostMatch>) {
        self.accounts.add_pool(pool, matches);
    }

    /// Attach `logger`: every attempt opens a record and every outcome closes it.
    ///
    /// Returns the id jobs address the logger with.
    pub fn add_logger(&self, logger: Arc<dyn JobLogger>) -> LoggerId {
        let id = self.loggers.register(Arc::clone(&logger));

        let weak = Arc::downgrade(&logger);
        let on_started = handler(move |info: &JobInfo| {
            if let Some(logger) = weak.upgrade() {
                if let Err(err) = logger.add_log(info) {
                    warn!(job_id = info.id, error = %err, "failed to open job log");
                }
            }
            None
        });
        let weak = Arc::downgrade(&logger);
        let on_error = handler(move |(info, failure): &(JobInfo, Failure)| {
            if let Some(logger) = weak.upgrade() {
                if let Err(err) = logger.log_aborted(info.id, failure) {
                    warn!(job_id = info.id, error = %err, "failed to close job log");
                }
            }
            None
        });
        let weak = Arc::downgrade(&logger);
        let on_succeeded = handler(move |info: &JobInfo| {
            if let Some(logger) = weak.upgrade() {
                if let Err(err) = logger.log_succeeded(info.id) {
                    warn!(job_id = info.id, error = %err, "failed to close job log");
                }
            }
            None
        });

        let events = self.workqueue.events();
        let _ = events.job_started.listen(&on_started);
        let _ = events.job_error.listen(&on_error);
        let _ = events.job_succeeded.listen(&on_succeeded);

        self.attached.lock().push(AttachedLogger {
            id,
            _logger: logger,
            _on_started: on_started,
            _on_error: on_error,
            _on_succeeded: on_succeeded,
        });
        debug!(logger = %id, "logger attached");
        id
    }

    fn host_job(&self, host: Host, function: &HostFn) -> Job {
        let accounts = Arc::clone(&self.accounts);
        let function = Arc::clone(function);
        let name = host.name().to_string();
        let target = host.clone();
        Job::new(name, move |ctx: &JobContext| {
            if accounts.n_accounts() == 0 {
                return function(ctx, &target, None);
            }
            let mut account = ctx.account_for_host(&target)?;
            let result = function(ctx, &target, Some(account.snapshot()));
            let released = account.release();
            result?;
            released?;
            Ok(())
        })
        .with_attempts(self.attempts)
        .with_data(host)
    }

    fn submit<H, F>(
        &self,
        hosts: impl IntoIterator<Item = H>,
        function: F,
        mut enqueue: impl FnMut(&WorkQueue, Job) -> Result<Option<(JobId, bool)>, QueueError>,
    ) -> Result<Task, QueueError>
    where
        H: Into<Host>,
        F: Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync + 'static,
    {
        let function: HostFn = Arc::new(function);
        let mut ids = Vec::new();
        for host in hosts {
            let job = self.host_job(host.into(), &function);
            if let Some((id, is_new)) = enqueue(&self.workqueue, job)? {
                if is_new {
                    self.progress.total.fetch_add(1, Ordering::AcqRel);
                }
                ids.push(id);
            }
        }
        info!(jobs = ids.len(), "hosts submitted");
        Ok(Task::new(&self.workqueue, ids))
    }

    /// Run `function` once per host, appended to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] if the queue was shut down.
    pub fn run<H, F>(
        &self,
        hosts: impl IntoIterator<Item = H>,
        function: F,
    ) -> Result<Task, QueueError>
    where
        H: Into<Host>,
        F: Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync + 'static,
    {
        self.submit(hosts, function, |wq, job| Ok(Some((wq.enqueue(job)?, true))))
    }

    /// Like [`Queue::run`], skipping hosts that already have a queued or running job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] if the queue was shut down.
    pub fn run_or_ignore<H, F>(
        &self,
        hosts: impl IntoIterator<Item = H>,
        function: F,
    ) -> Result<Task, QueueError>
    where
        H: Into<Host>,
        F: Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync + 'static,
    {
        self.submit(hosts, function, |wq, job| {
            Ok(wq.enqueue_or_ignore(job)?.map(|id| (id, true)))
        })
    }

    /// Like [`Queue::run`], putting the hosts at the front of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] if the queue was shut down.
    pub fn priority_run<H, F>(
        &self,
        hosts: impl IntoIterator<Item = H>,
        function: F,
    ) -> Result<Task, QueueError>
    where
        H: Into<Host>,
        F: Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync + 'static,
    {
        self.submit(hosts, function, |wq, job| {
            Ok(Some((wq.priority_enqueue(job, false)?, true)))
        })
    }

    /// Like [`Queue::priority_run`]; hosts already queued are moved to the front instead of
    /// being added twice, hosts already running are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] if the queue was shut down.
    pub fn priority_run_or_raise<H, F>(
        &self,
        hosts: impl IntoIterator<Item = H>,
        function: F,
    ) -> Result<Task, QueueError>
    where
        H: Into<Host>,
        F: Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync + 'static,
    {
        self.submit(hosts, function, |wq, job| {
            let promotion = wq.priority_enqueue_or_raise(job, false)?;
            Ok(Some((promotion.id(), matches!(promotion, Promotion::Enqueued(_)))))
        })
    }

    /// Start `function` for every host right away, ignoring the concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] if the queue was shut down.
    pub fn force_run<H, F>(
        &self,
        hosts: impl IntoIterator<Item = H>,
        function: F,
    ) -> Result<Task, QueueError>
    where
        H: Into<Host>,
        F: Fn(&JobContext, &Host, Option<&AccountSnapshot>) -> JobResult + Send + Sync + 'static,
    {
        self.submit(hosts, function, |wq, job| {
            Ok(Some((wq.priority_enqueue(job, true)?, true)))
        })
    }

    /// Enqueue a host-less job with `attempts` attempts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] if the queue was shut down.
    pub fn enqueue<F>(
        &self,
        function: F,
        name: impl Into<String>,
        attempts: u32,
    ) -> Result<JobId, QueueError>
    where
        F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
    {
        let id = self
            .workqueue
            .enqueue(Job::new(name, function).with_attempts(attempts))?;
        self.progress.total.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    /// Block until every job finished.
    pub fn wait_until_done(&self) {
        self.workqueue.wait_until_done();
    }

    /// Stop the queue. Without `force`, waits for every job first; with `force`, queued jobs
    /// are dropped, running ones are asked to cancel and waits for an account fail.
    pub fn shutdown(&self, force: bool) {
        if force {
            self.workqueue.shutdown_now(false);
        } else {
            self.workqueue.wait_until_done();
            self.workqueue.shutdown(false);
        }
    }

    /// Shut down, then forget every account and logger.
    pub fn destroy(&self, force: bool) {
        self.shutdown(force);
        self.accounts.reset();
        self.detach_loggers();
    }

    /// Drop queued jobs, wait for running ones, forget every account and logger and start
    /// over with zeroed progress.
    pub fn reset(&self) {
        self.workqueue.shutdown(true);
        self.accounts.reset();
        self.detach_loggers();
        self.progress.total.store(0, Ordering::Release);
        self.progress.completed.store(0, Ordering::Release);
    }

    fn detach_loggers(&self) {
        for attached in self.attached.lock().drain(..) {
            self.loggers.unregister(attached.id);
        }
    }

    /// Whether nothing is queued or running.
    pub fn is_completed(&self) -> bool {
        self.workqueue.is_empty()
    }

    /// Percentage of submitted jobs that finished; 100 when nothing was submitted.
    #[allow(clippy::cast_precision_loss)]
    pub fn get_progress(&self) -> f64 {
        let total = self.progress.total.load(Ordering::Acquire);
        if total == 0 {
            return 100.0;
        }
        let completed = self.progress.completed.load(Ordering::Acquire).min(total);
        completed as f64 / total as f64 * 100.0
    }

    /// Current concurrency limit.
    pub fn get_max_threads(&self) -> usize {
        self.workqueue.get_max_threads()
    }

    /// Change the concurrency limit.
    pub fn set_max_threads(&self, max_threads: usize) {
        self.workqueue.set_max_threads(max_threads);
    }
}
