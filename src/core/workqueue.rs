//! Job scheduler built on the [`Pipeline`].
//!
//! One dispatch thread pulls jobs out of the pipeline and hands each to a supervisor thread.
//! The supervisor runs the job's attempts on workers obtained from a [`Spawn`]
//! implementation, serves the worker's requests over the pipe, emits lifecycle events and
//! finally releases the job's accounts and its pipeline slot.
//!
//! # Design
//!
//! - **No polling**: the dispatch thread blocks in [`Pipeline::next`]
//! - **Failures are events**: user errors and panics never reach the dispatch loop
//! - **Clean shutdown**: stopping the pipeline unblocks the dispatcher; supervisors are joined

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::account::OwnerToken;
use crate::core::error::QueueError;
use crate::core::event::Event;
use crate::core::job::{run_callable, CancelToken, Failure, Job, JobContext, JobId, JobInfo, Outcome};
use crate::core::pipeline::{ItemState, Pipeline, Promotion};
use crate::core::worker::{Spawn, WorkFn};
use crate::infra::pipe;
use crate::infra::service::Services;
use crate::runtime::ThreadSpawner;

/// Lifecycle events of a [`WorkQueue`].
#[derive(Debug, Default)]
pub struct QueueEvents {
    /// A job was picked up by a supervisor, before its first attempt.
    pub job_init: Event<JobInfo>,
    /// An attempt is about to run.
    pub job_started: Event<JobInfo>,
    /// An attempt failed.
    pub job_error: Event<(JobInfo, Failure)>,
    /// The job succeeded.
    pub job_succeeded: Event<JobInfo>,
    /// The job failed for good. Fired once, after the last `job_error`.
    pub job_aborted: Event<(JobInfo, Failure)>,
    /// The last tracked job finished.
    pub queue_empty: Event<()>,
}

struct Inner {
    pipeline: Pipeline<Arc<Job>>,
    spawner: Arc<dyn Spawn>,
    services: Services,
    events: QueueEvents,
    accepting: Mutex<bool>,
    cancels: Mutex<HashMap<JobId, Arc<CancelToken>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Unblock the dispatcher; threads are detached rather than joined here.
        self.pipeline.stop();
        debug!("work queue dropped without shutdown, dispatcher detached");
    }
}

/// Bounded-concurrency job scheduler.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("max_threads", &self.get_max_threads())
            .field("queued", &self.n_queued())
            .field("running", &self.n_running())
            .finish()
    }
}

impl WorkQueue {
    /// Create a queue running at most `max_threads` jobs at once on OS threads.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Spawn`] if the dispatch thread cannot be started.
    pub fn new(max_threads: usize) -> Result<Self, QueueError> {
        Self::with_spawner(max_threads, Arc::new(ThreadSpawner::new()), Services::default())
    }

    /// Create a queue with an explicit worker spawner and supervisor services.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] for a zero `max_threads`, or
    /// [`QueueError::Spawn`] if the dispatch thread cannot be started.
    pub fn with_spawner(
        max_threads: usize,
        spawner: Arc<dyn Spawn>,
        services: Services,
    ) -> Result<Self, QueueError> {
        if max_threads == 0 {
            return Err(QueueError::InvalidConfig(
                "max_threads must be greater than 0".into(),
            ));
        }
        let queue = Self {
            inner: Arc::new(Inner {
                pipeline: Pipeline::new(max_threads),
                spawner,
                services,
                events: QueueEvents::default(),
                accepting: Mutex::new(true),
                cancels: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(None),
                supervisors: Mutex::new(Vec::new()),
            }),
        };
        queue.start_dispatcher()?;
        info!(max_threads, "work queue started");
        Ok(queue)
    }

    fn start_dispatcher(&self) -> Result<(), QueueError> {
        let pipeline = self.inner.pipeline.clone();
        let weak = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name("hostqueue-dispatch".into())
            .spawn(move || dispatch_loop(&pipeline, &weak))
            .map_err(|e| QueueError::Spawn(e.to_string()))?;
        *self.inner.dispatcher.lock() = Some(handle);
        Ok(())
    }

    /// Lifecycle events.
    pub fn events(&self) -> &QueueEvents {
        &self.inner.events
    }

    /// Services supervisors hand to jobs.
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    fn submit<T>(&self, f: impl FnOnce(&Pipeline<Arc<Job>>) -> T) -> Result<T, QueueError> {
        let accepting = self.inner.accepting.lock();
        if !*accepting {
            return Err(QueueError::ShutDown);
        }
        Ok(f(&self.inner.pipeline))
    }

    /// Append `job` to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] after [`WorkQueue::shutdown`] without restart.
    pub fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let name = job.name().to_string();
        let id = self.submit(|p| p.enqueue(Arc::new(job), Some(name)))?;
        debug!(job_id = id, "job enqueued");
        Ok(id)
    }

    /// Append `job` unless a job with the same name is queued or running.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] after [`WorkQueue::shutdown`] without restart.
    pub fn enqueue_or_ignore(&self, job: Job) -> Result<Option<JobId>, QueueError> {
        let name = job.name().to_string();
        self.submit(|p| p.enqueue_or_ignore(Arc::new(job), &name))
    }

    /// Put `job` at the front of the queue, or start it right away with `force_start`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] after [`WorkQueue::shutdown`] without restart.
    pub fn priority_enqueue(&self, job: Job, force_start: bool) -> Result<JobId, QueueError> {
        let name = job.name().to_string();
        self.submit(|p| p.priority_enqueue(Arc::new(job), Some(name), force_start))
    }

    /// Put `job` at the front unless a job with the same name runs; a queued one is promoted.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] after [`WorkQueue::shutdown`] without restart.
    pub fn priority_enqueue_or_raise(
        &self,
        job: Job,
        force_start: bool,
    ) -> Result<Promotion, QueueError> {
        let name = job.name().to_string();
        self.submit(|p| p.priority_enqueue_or_raise(Arc::new(job), &name, force_start))
    }

    /// Release the concurrency slot of running job `id` while it waits on other jobs.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Pipeline`] if the job is not running.
    pub fn sleep(&self, id: JobId) -> Result<(), QueueError> {
        Ok(self.inner.pipeline.sleep(id)?)
    }

    /// Reclaim the concurrency slot of sleeping job `id`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Pipeline`] if the job is not sleeping.
    pub fn wake(&self, id: JobId) -> Result<(), QueueError> {
        Ok(self.inner.pipeline.wake(id)?)
    }

    /// Stop dispatching new jobs.
    pub fn pause(&self) {
        self.inner.pipeline.pause();
    }

    /// Resume dispatching.
    pub fn unpause(&self) {
        self.inner.pipeline.unpause();
    }

    /// Block until job `id` finished. Unknown ids return immediately.
    pub fn wait_for(&self, id: JobId) {
        self.inner.pipeline.wait_for(id);
    }

    /// Block until nothing is queued or running.
    pub fn wait_until_done(&self) {
        self.inner.pipeline.wait_until_done();
    }

    /// Change the concurrency limit.
    pub fn set_max_threads(&self, max_threads: usize) {
        self.inner.pipeline.set_max_concurrency(max_threads.max(1));
    }

    /// Current concurrency limit.
    pub fn get_max_threads(&self) -> usize {
        self.inner.pipeline.max_concurrency()
    }

    /// Number of tracked jobs.
    pub fn len(&self) -> usize {
        self.inner.pipeline.len()
    }

    /// Whether no job is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.pipeline.is_empty()
    }

    /// Number of dispatched jobs.
    pub fn n_running(&self) -> usize {
        self.inner.pipeline.n_running()
    }

    /// Number of jobs waiting for dispatch.
    pub fn n_queued(&self) -> usize {
        self.inner.pipeline.n_queued()
    }

    /// Whether job `id` is still tracked.
    pub fn has_job(&self, id: JobId) -> bool {
        self.inner.pipeline.has_id(id)
    }

    /// State of job `id`.
    pub fn job_state(&self, id: JobId) -> Option<ItemState> {
        self.inner.pipeline.state(id)
    }

    /// Whether the queue accepts jobs.
    pub fn is_accepting(&self) -> bool {
        *self.inner.accepting.lock()
    }

    /// Fire the cancellation token of every running job.
    ///
    /// Account acquisitions the jobs are blocked in, or make later, fail with
    /// [`AccountError::Aborted`](crate::core::error::AccountError::Aborted).
    pub fn cancel_running(&self) {
        let tokens: Vec<Arc<CancelToken>> = self.inner.cancels.lock().values().cloned().collect();
        info!(jobs = tokens.len(), "cancelling running jobs");
        for token in tokens {
            token.cancel();
        }
    }

    /// Stop dispatching, drop queued jobs and join the dispatcher and every supervisor.
    ///
    /// Running jobs are waited for. With `restart` the queue accepts jobs again afterwards;
    /// otherwise every later enqueue fails with [`QueueError::ShutDown`].
    pub fn shutdown(&self, restart: bool) {
        self.stop(restart, false);
    }

    /// Like [`WorkQueue::shutdown`], but cancels the running jobs once dispatch has stopped,
    /// so jobs waiting for an account give up instead of being waited for.
    pub fn shutdown_now(&self, restart: bool) {
        self.stop(restart, true);
    }

    fn stop(&self, restart: bool, cancel: bool) {
        info!(restart, cancel, "shutting down work queue");
        {
            let mut accepting = self.inner.accepting.lock();
            *accepting = false;
            self.inner.pipeline.stop();
            let dropped = self.inner.pipeline.drain_queued();
            if !dropped.is_empty() {
                debug!(dropped = dropped.len(), "queued jobs dropped");
            }
        }
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if dispatcher.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
        if cancel {
            self.cancel_running();
        }
        let supervisors = std::mem::take(&mut *self.inner.supervisors.lock());
        let me = thread::current().id();
        for supervisor in supervisors {
            if supervisor.thread().id() == me {
                continue;
            }
            if supervisor.join().is_err() {
                warn!("supervisor thread panicked");
            }
        }
        self.inner.pipeline.clear();
        if restart {
            self.inner.pipeline.start();
            *self.inner.accepting.lock() = true;
            if let Err(err) = self.start_dispatcher() {
                error!(error = %err, "failed to restart dispatcher");
                *self.inner.accepting.lock() = false;
            }
        }
        info!("work queue shut down");
    }
}

fn dispatch_loop(pipeline: &Pipeline<Arc<Job>>, inner: &Weak<Inner>) {
    debug!("dispatch loop started");
    while let Some((id, job)) = pipeline.next() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // Visible to cancel_running from here on.
        let cancel = Arc::new(CancelToken::new());
        inner.cancels.lock().insert(id, Arc::clone(&cancel));
        let supervised = Arc::clone(&inner);
        let spare = Arc::clone(&job);
        let spawned = thread::Builder::new()
            .name(format!("hostqueue-job-{id}"))
            .spawn(move || supervise(&supervised, id, &job, &cancel));
        match spawned {
            Ok(handle) => {
                let mut supervisors = inner.supervisors.lock();
                supervisors.retain(|h| !h.is_finished());
                supervisors.push(handle);
            }
            Err(err) => {
                error!(job_id = id, error = %err, "failed to start supervisor");
                inner.cancels.lock().remove(&id);
                let info = spare.info(id, 1);
                let failure = Failure::new("spawn", err.to_string());
                spare.record_failure();
                inner.events.job_error.emit(&(info.clone(), failure.clone()));
                inner.events.job_aborted.emit(&(info, failure));
                inner.finish(id, &OwnerToken::from(id));
            }
        }
    }
    debug!("dispatch loop exiting");
}

fn supervise(inner: &Arc<Inner>, id: JobId, job: &Arc<Job>, cancel: &Arc<CancelToken>) {
    let owner = OwnerToken::from(id);
    {
        let accounts = Arc::clone(inner.services.accounts());
        let owner = owner.clone();
        cancel.on_cancel(move || accounts.abort(&owner));
    }
    inner.events.job_init.emit(&job.info(id, 1));

    for attempt in 1..=job.times() {
        let info = job.info(id, attempt);
        debug!(job_id = id, attempt, "job attempt starting");
        inner.events.job_started.emit(&info);
        match inner.run_attempt(&info, job, cancel, &owner) {
            Outcome::Succeeded => {
                debug!(job_id = id, attempt, "job succeeded");
                inner.events.job_succeeded.emit(&info);
                break;
            }
            Outcome::Retryable(failure) if attempt < job.times() && !cancel.is_cancelled() => {
                job.record_failure();
                warn!(job_id = id, attempt, error = %failure, "job attempt failed, retrying");
                inner.events.job_error.emit(&(info, failure));
            }
            Outcome::Retryable(failure) | Outcome::Fatal(failure) => {
                job.record_failure();
                warn!(job_id = id, attempt, error = %failure, "job aborted");
                inner.events.job_error.emit(&(info.clone(), failure.clone()));
                inner.events.job_aborted.emit(&(info, failure));
                break;
            }
        }
    }

    inner.cancels.lock().remove(&id);
    inner.finish(id, &owner);
}

impl Inner {
    fn run_attempt(
        &self,
        info: &JobInfo,
        job: &Job,
        cancel: &Arc<CancelToken>,
        owner: &OwnerToken,
    ) -> Outcome {
        let (worker_end, supervisor_end) = pipe::duplex();
        let ctx = JobContext::new(
            info.clone(),
            worker_end,
            job.data(),
            Arc::clone(cancel),
            self.services.loggers().ids(),
        );
        let function = job.function();
        let work: WorkFn = Box::new(move || {
            let outcome = run_callable(&function, &ctx);
            ctx.finish(outcome);
        });
        let name = format!("hostqueue-worker-{}-{}", info.id, info.attempt);
        let handle = match self.spawner.spawn(&name, work) {
            Ok(handle) => handle,
            Err(err) => {
                error!(job_id = info.id, error = %err, "failed to spawn worker");
                return Outcome::Fatal(Failure::new("spawn", err.to_string()));
            }
        };
        let outcome = self.services.serve(owner, &supervisor_end);
        if !handle.join() {
            warn!(job_id = info.id, "worker panicked outside the job boundary");
        }
        outcome
    }

    fn finish(&self, id: JobId, owner: &OwnerToken) {
        self.services.release_accounts(owner);
        self.pipeline.task_done(id);
        if self.pipeline.is_empty() {
            debug!("queue empty");
            self.events.queue_empty.emit(&());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::handler;
    use crate::core::job::JobError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(event: &Event<JobInfo>) -> (Arc<AtomicUsize>, crate::core::event::Handler<JobInfo>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb = handler(move |_: &JobInfo| {
            h.fetch_add(1, Ordering::SeqCst);
            None
        });
        event.connect(&cb).unwrap();
        (hits, cb)
    }

    #[test]
    fn test_retry_until_success() {
        let queue = WorkQueue::new(2).unwrap();
        let (started, _s) = counter(&queue.events().job_started);
        let (succeeded, _o) = counter(&queue.events().job_succeeded);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let on_error = handler(move |_: &(JobInfo, Failure)| {
            e.fetch_add(1, Ordering::SeqCst);
            None
        });
        queue.events().job_error.connect(&on_error).unwrap();

        let job = Job::new("flaky", |ctx: &JobContext| {
            if ctx.attempt() < 3 {
                return Err(anyhow::anyhow!("attempt {}", ctx.attempt()).into());
            }
            Ok(())
        })
        .with_attempts(3);
        let id = queue.enqueue(job).unwrap();
        queue.wait_for(id);

        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(succeeded.load(Ordering::SeqCst), 1);
        queue.shutdown(false);
    }

    #[test]
    fn test_fatal_error_skips_retries() {
        let queue = WorkQueue::new(1).unwrap();
        let (started, _s) = counter(&queue.events().job_started);
        let aborted = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&aborted);
        let on_abort = handler(move |(info, failure): &(JobInfo, Failure)| {
            a.lock().push((info.attempt, failure.kind.clone()));
            None
        });
        queue.events().job_aborted.connect(&on_abort).unwrap();

        let id = queue
            .enqueue(
                Job::new("bad", |_: &JobContext| {
                    Err(JobError::fatal(anyhow::anyhow!("auth failed")))
                })
                .with_attempts(5),
            )
            .unwrap();
        queue.wait_for(id);

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(*aborted.lock(), vec![(1, "fatal".to_string())]);
        queue.shutdown(false);
    }

    #[test]
    fn test_panic_is_reported_not_propagated() {
        let queue = WorkQueue::new(1).unwrap();
        let aborted = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&aborted);
        let on_abort = handler(move |(_, failure): &(JobInfo, Failure)| {
            assert_eq!(failure.kind, "panic");
            a.fetch_add(1, Ordering::SeqCst);
            None
        });
        queue.events().job_aborted.connect(&on_abort).unwrap();

        let first = queue
            .enqueue(Job::new("boom", |_: &JobContext| -> crate::core::job::JobResult {
                panic!("device exploded")
            }))
            .unwrap();
        let (ok, _h) = counter(&queue.events().job_succeeded);
        let second = queue.enqueue(Job::new("fine", |_: &JobContext| Ok(()))).unwrap();
        queue.wait_for(first);
        queue.wait_for(second);

        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        queue.shutdown(false);
    }

    #[test]
    fn test_job_data_reaches_context() {
        let queue = WorkQueue::new(1).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let id = queue
            .enqueue(
                Job::new("data", move |ctx: &JobContext| {
                    *s.lock() = ctx.data::<String>().cloned();
                    Ok(())
                })
                .with_data("payload".to_string()),
            )
            .unwrap();
        queue.wait_for(id);
        assert_eq!(seen.lock().as_deref(), Some("payload"));
        queue.shutdown(false);
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let queue = WorkQueue::new(1).unwrap();
        queue.shutdown(false);
        assert!(matches!(
            queue.enqueue(Job::new("late", |_: &JobContext| Ok(()))),
            Err(QueueError::ShutDown)
        ));
    }

    #[test]
    fn test_restart_accepts_jobs_again() {
        let queue = WorkQueue::new(1).unwrap();
        queue.shutdown(true);
        let (ok, _h) = counter(&queue.events().job_succeeded);
        let id = queue.enqueue(Job::new("again", |_: &JobContext| Ok(()))).unwrap();
        queue.wait_for(id);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        queue.shutdown(false);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(WorkQueue::new(0), Err(QueueError::InvalidConfig(_))));
    }
}
