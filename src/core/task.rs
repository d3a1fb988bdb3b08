//! Groups of jobs that can be waited on together.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::event::{handler, Event, Handler};
use crate::core::job::{Failure, JobId, JobInfo};
use crate::core::workqueue::WorkQueue;

struct TaskInner {
    queue: WorkQueue,
    ids: Vec<JobId>,
    pending: Mutex<HashSet<JobId>>,
    done: Event<()>,
    fired: AtomicBool,
}

impl TaskInner {
    fn mark_finished(&self, id: JobId) {
        let now_empty = {
            let mut pending = self.pending.lock();
            pending.remove(&id) && pending.is_empty()
        };
        if now_empty {
            self.fire_done();
        }
    }

    // Jobs that finished before the handlers were in place are no longer tracked.
    fn prune(&self) {
        let now_empty = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|id| self.queue.has_job(*id));
            before > 0 && pending.is_empty()
        };
        if now_empty {
            self.fire_done();
        }
    }

    fn fire_done(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.done.emit(&());
        }
    }
}

/// Handle to the jobs created by one queue submission.
pub struct Task {
    inner: Arc<TaskInner>,
    on_succeeded: Handler<JobInfo>,
    on_aborted: Handler<(JobInfo, Failure)>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("jobs", &self.inner.ids)
            .field("completed", &self.n_completed())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Track `ids` on `queue`.
    pub fn new(queue: &WorkQueue, ids: Vec<JobId>) -> Self {
        let inner = Arc::new(TaskInner {
            queue: queue.clone(),
            pending: Mutex::new(ids.iter().copied().collect()),
            ids,
            done: Event::new(),
            fired: AtomicBool::new(false),
        });

        let weak: Weak<TaskInner> = Arc::downgrade(&inner);
        let on_succeeded = handler(move |info: &JobInfo| {
            if let Some(inner) = weak.upgrade() {
                inner.mark_finished(info.id);
            }
            None
        });
        let weak: Weak<TaskInner> = Arc::downgrade(&inner);
        let on_aborted = handler(move |(info, _): &(JobInfo, Failure)| {
            if let Some(inner) = weak.upgrade() {
                inner.mark_finished(info.id);
            }
            None
        });
        // Fresh handlers cannot already be subscribed.
        let _ = queue.events().job_succeeded.listen(&on_succeeded);
        let _ = queue.events().job_aborted.listen(&on_aborted);
        inner.prune();

        Self {
            inner,
            on_succeeded,
            on_aborted,
        }
    }

    /// Ids of the jobs in this task.
    pub fn job_ids(&self) -> &[JobId] {
        &self.inner.ids
    }

    /// Number of jobs in this task.
    pub fn n_jobs(&self) -> usize {
        self.inner.ids.len()
    }

    /// Number of jobs that finished, successfully or not.
    pub fn n_completed(&self) -> usize {
        self.inner.prune();
        self.inner.ids.len() - self.inner.pending.lock().len()
    }

    /// Whether every job finished.
    pub fn is_completed(&self) -> bool {
        self.inner.prune();
        self.inner.pending.lock().is_empty()
    }

    /// Fired once, when the last job of the task finished.
    pub fn done(&self) -> &Event<()> {
        &self.inner.done
    }

    /// Block until every job of the task finished.
    pub fn wait(&self) {
        for id in &self.inner.ids {
            self.inner.queue.wait_for(*id);
        }
        self.inner.prune();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let events = self.inner.queue.events();
        events.job_succeeded.disconnect(&self.on_succeeded);
        events.job_aborted.disconnect(&self.on_aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{Job, JobContext};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_task_completes_with_mixed_outcomes() {
        let queue = WorkQueue::new(2).unwrap();
        let ids = vec![
            queue.enqueue(Job::new("ok", |_: &JobContext| Ok(()))).unwrap(),
            queue
                .enqueue(Job::new("bad", |_: &JobContext| {
                    Err(anyhow::anyhow!("nope").into())
                }))
                .unwrap(),
        ];
        let task = Task::new(&queue, ids);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let on_done = handler(move |(): &()| {
            f.fetch_add(1, Ordering::SeqCst);
            None
        });
        task.done().connect(&on_done).unwrap();

        task.wait();
        assert!(task.is_completed());
        assert_eq!(task.n_completed(), 2);
        assert!(fired.load(Ordering::SeqCst) <= 1);
        queue.shutdown(false);
    }

    #[test]
    fn test_empty_task_is_completed() {
        let queue = WorkQueue::new(1).unwrap();
        let task = Task::new(&queue, Vec::new());
        assert!(task.is_completed());
        assert_eq!(task.n_jobs(), 0);
        queue.shutdown(false);
    }

    #[test]
    fn test_dropped_task_unsubscribes() {
        let queue = WorkQueue::new(1).unwrap();
        let before = queue.events().job_succeeded.n_subscribers();
        drop(Task::new(&queue, vec![42]));
        assert_eq!(queue.events().job_succeeded.n_subscribers(), before);
        queue.shutdown(false);
    }
}
