//! Bounded-concurrency item queue with priority, force-start and sleep/wake.
//!
//! The pipeline is a monitor: one `parking_lot::Mutex` guards every collection and one
//! `Condvar` wakes waiters after each mutation. Every blocking call re-checks its predicate
//! in a loop, so spurious wakeups are harmless.
//!
//! Items move through `Queued` (or `Forced`) → `Running` (↔ `Sleeping`) → forgotten.
//! A running item counts against `max_concurrency` unless it sleeps; forced items are
//! handed out before anything else and ignore the limit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::core::error::PipelineError;

/// Identifier assigned to an item when it enters the pipeline. Never zero.
pub type ItemId = u64;

/// Where an item currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting in the FIFO.
    Queued,
    /// Waiting in the force-start queue; dispatched before anything else.
    Forced,
    /// Dispatched and counted against the concurrency limit.
    Running,
    /// Dispatched but not counted against the concurrency limit.
    Sleeping,
}

/// Result of [`Pipeline::priority_enqueue_or_raise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// No item of that name existed; a new one was put at the front.
    Enqueued(ItemId),
    /// A queued item of that name was moved to the front.
    Promoted(ItemId),
    /// An item of that name is already running or force-started.
    Unchanged(ItemId),
}

impl Promotion {
    /// The id of the affected item.
    #[must_use]
    pub const fn id(self) -> ItemId {
        match self {
            Self::Enqueued(id) | Self::Promoted(id) | Self::Unchanged(id) => id,
        }
    }

    /// Whether an item is now at the front of the pipeline.
    #[must_use]
    pub const fn is_success(self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

struct Entry<T> {
    item: T,
    name: Option<String>,
}

struct PipelineState<T> {
    running: bool,
    paused: bool,
    max_concurrency: usize,
    next_id: ItemId,
    queue: VecDeque<ItemId>,
    force: VecDeque<ItemId>,
    working: HashSet<ItemId>,
    sleeping: HashSet<ItemId>,
    items: HashMap<ItemId, Entry<T>>,
    names: HashMap<String, ItemId>,
}

impl<T> PipelineState<T> {
    fn new(max_concurrency: usize) -> Self {
        Self {
            running: true,
            paused: false,
            max_concurrency,
            next_id: 1,
            queue: VecDeque::new(),
            force: VecDeque::new(),
            working: HashSet::new(),
            sleeping: HashSet::new(),
            items: HashMap::new(),
            names: HashMap::new(),
        }
    }

    fn register(&mut self, item: T, name: Option<String>) -> ItemId {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(name) = &name {
            self.names.insert(name.clone(), id);
        }
        self.items.insert(id, Entry { item, name });
        id
    }

    fn unregister(&mut self, id: ItemId) -> Option<T> {
        let entry = self.items.remove(&id)?;
        if let Some(name) = entry.name {
            // A later item may have claimed the same name.
            if self.names.get(&name) == Some(&id) {
                self.names.remove(&name);
            }
        }
        Some(entry.item)
    }

    fn state(&self, id: ItemId) -> Option<ItemState> {
        if !self.items.contains_key(&id) {
            return None;
        }
        if self.sleeping.contains(&id) {
            Some(ItemState::Sleeping)
        } else if self.working.contains(&id) {
            Some(ItemState::Running)
        } else if self.force.contains(&id) {
            Some(ItemState::Forced)
        } else {
            Some(ItemState::Queued)
        }
    }

    fn active(&self) -> usize {
        self.working.len() - self.sleeping.len()
    }

    fn dispatch(&mut self, id: ItemId) -> Option<(ItemId, T)>
    where
        T: Clone,
    {
        self.working.insert(id);
        self.items.get(&id).map(|e| (id, e.item.clone()))
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.force.clear();
        self.working.clear();
        self.sleeping.clear();
        self.items.clear();
        self.names.clear();
    }
}

struct Shared<T> {
    state: Mutex<PipelineState<T>>,
    cond: Condvar,
}

/// Bounded-concurrency queue handing out items to a dispatcher.
///
/// Cloning a `Pipeline` yields another handle to the same queue.
pub struct Pipeline<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Pipeline<T> {
    /// Create a pipeline that runs at most `max_concurrency` items at once.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PipelineState::new(max_concurrency)),
                cond: Condvar::new(),
            }),
        }
    }

    fn notify(&self) {
        self.shared.cond.notify_all();
    }

    /// Number of tracked items (queued, forced, running or sleeping).
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    /// Number of items waiting for dispatch, forced ones included.
    pub fn n_queued(&self) -> usize {
        let st = self.shared.state.lock();
        st.queue.len() + st.force.len()
    }

    /// Number of dispatched items, sleeping ones included.
    pub fn n_running(&self) -> usize {
        self.shared.state.lock().working.len()
    }

    /// Number of sleeping items.
    pub fn n_sleeping(&self) -> usize {
        self.shared.state.lock().sleeping.len()
    }

    /// Ids of all dispatched items.
    pub fn running_ids(&self) -> Vec<ItemId> {
        self.shared.state.lock().working.iter().copied().collect()
    }

    /// Whether `id` is still tracked.
    pub fn has_id(&self, id: ItemId) -> bool {
        self.shared.state.lock().items.contains_key(&id)
    }

    /// Current state of `id`, or `None` once it completed or was never known.
    pub fn state(&self, id: ItemId) -> Option<ItemState> {
        self.shared.state.lock().state(id)
    }

    /// The tracked item registered under `name`.
    pub fn get_from_name(&self, name: &str) -> Option<(ItemId, T)> {
        let st = self.shared.state.lock();
        let id = *st.names.get(name)?;
        st.items.get(&id).map(|e| (id, e.item.clone()))
    }

    /// Change the concurrency limit. Waiting dispatchers re-evaluate immediately.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.shared.state.lock().max_concurrency = max_concurrency;
        self.notify();
    }

    /// Current concurrency limit.
    pub fn max_concurrency(&self) -> usize {
        self.shared.state.lock().max_concurrency
    }

    /// Append `item` to the back of the FIFO.
    pub fn enqueue(&self, item: T, name: Option<String>) -> ItemId {
        let mut st = self.shared.state.lock();
        let id = st.register(item, name);
        st.queue.push_back(id);
        drop(st);
        self.notify();
        id
    }

    /// Append `item` unless an item called `name` is queued or running.
    pub fn enqueue_or_ignore(&self, item: T, name: &str) -> Option<ItemId> {
        let mut st = self.shared.state.lock();
        if st.names.contains_key(name) {
            return None;
        }
        let id = st.register(item, Some(name.to_string()));
        st.queue.push_back(id);
        drop(st);
        self.notify();
        Some(id)
    }

    /// Insert `item` at the front of the FIFO, or into the force-start queue.
    pub fn priority_enqueue(&self, item: T, name: Option<String>, force_start: bool) -> ItemId {
        let mut st = self.shared.state.lock();
        let id = st.register(item, name);
        if force_start {
            st.force.push_back(id);
        } else {
            st.queue.push_front(id);
        }
        drop(st);
        self.notify();
        id
    }

    /// Put an item called `name` at the front without duplicating it.
    ///
    /// A running or force-started item is left alone; a queued one is moved to the front
    /// (or into the force-start queue); otherwise `item` is inserted at the front.
    pub fn priority_enqueue_or_raise(&self, item: T, name: &str, force_start: bool) -> Promotion {
        let mut st = self.shared.state.lock();
        let outcome = match st.names.get(name).copied() {
            Some(id) if st.working.contains(&id) || st.force.contains(&id) => {
                return Promotion::Unchanged(id);
            }
            Some(id) => {
                st.queue.retain(|q| *q != id);
                if force_start {
                    st.force.push_back(id);
                } else {
                    st.queue.push_front(id);
                }
                Promotion::Promoted(id)
            }
            None => {
                let id = st.register(item, Some(name.to_string()));
                if force_start {
                    st.force.push_back(id);
                } else {
                    st.queue.push_front(id);
                }
                Promotion::Enqueued(id)
            }
        };
        drop(st);
        self.notify();
        outcome
    }

    /// The item `next()` would hand out right now, without dispatching it.
    pub fn try_next(&self) -> Option<ItemId> {
        let st = self.shared.state.lock();
        st.force.front().or_else(|| st.queue.front()).copied()
    }

    /// Block until an item may run and dispatch it.
    ///
    /// Forced items go first regardless of capacity. Queued items wait until fewer than
    /// `max_concurrency` non-sleeping items run. Returns `None` once the pipeline is stopped.
    pub fn next(&self) -> Option<(ItemId, T)> {
        let mut st = self.shared.state.lock();
        loop {
            if !st.running {
                return None;
            }
            if st.paused {
                self.shared.cond.wait(&mut st);
                continue;
            }
            if let Some(id) = st.force.pop_front() {
                let dispatched = st.dispatch(id);
                drop(st);
                self.notify();
                return dispatched;
            }
            if st.active() >= st.max_concurrency {
                self.shared.cond.wait(&mut st);
                continue;
            }
            if let Some(id) = st.queue.pop_front() {
                let dispatched = st.dispatch(id);
                drop(st);
                self.notify();
                return dispatched;
            }
            self.shared.cond.wait(&mut st);
        }
    }

    /// Mark a dispatched item as complete and forget it.
    ///
    /// Returns `false` if the item was not running, e.g. after the pipeline was cleared.
    pub fn task_done(&self, id: ItemId) -> bool {
        let mut st = self.shared.state.lock();
        let was_working = st.working.remove(&id);
        if was_working {
            st.sleeping.remove(&id);
            st.unregister(id);
        }
        drop(st);
        self.notify();
        was_working
    }

    /// Stop counting a running item against the concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotRunning`] if the item is not dispatched.
    pub fn sleep(&self, id: ItemId) -> Result<(), PipelineError> {
        let mut st = self.shared.state.lock();
        if !st.working.contains(&id) {
            return Err(PipelineError::NotRunning(id));
        }
        st.sleeping.insert(id);
        drop(st);
        self.notify();
        Ok(())
    }

    /// Count a sleeping item against the concurrency limit again.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotSleeping`] if the item is not asleep.
    pub fn wake(&self, id: ItemId) -> Result<(), PipelineError> {
        let mut st = self.shared.state.lock();
        if !st.sleeping.remove(&id) {
            return Err(PipelineError::NotSleeping(id));
        }
        drop(st);
        self.notify();
        Ok(())
    }

    /// Suspend dispatch. Running items are not affected.
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
        self.notify();
    }

    /// Resume dispatch.
    pub fn unpause(&self) {
        self.shared.state.lock().paused = false;
        self.notify();
    }

    /// Whether dispatch is suspended.
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Make `next()` return `None` until [`Pipeline::start`] is called.
    pub fn stop(&self) {
        self.shared.state.lock().running = false;
        self.notify();
    }

    /// Allow dispatch again after [`Pipeline::stop`].
    pub fn start(&self) {
        self.shared.state.lock().running = true;
        self.notify();
    }

    /// Whether the pipeline has not been stopped.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Forget every queued and forced item, leaving running ones tracked.
    pub fn drain_queued(&self) -> Vec<T> {
        let mut st = self.shared.state.lock();
        let mut ids: Vec<ItemId> = st.force.drain(..).collect();
        ids.extend(st.queue.drain(..));
        let drained = ids.into_iter().filter_map(|id| st.unregister(id)).collect();
        drop(st);
        self.notify();
        drained
    }

    /// Forget every item, running ones included.
    pub fn clear(&self) {
        self.shared.state.lock().clear();
        self.notify();
    }

    /// Block until `id` is no longer tracked. Unknown ids return immediately.
    pub fn wait_for(&self, id: ItemId) {
        let mut st = self.shared.state.lock();
        while st.items.contains_key(&id) {
            self.shared.cond.wait(&mut st);
        }
    }

    /// Block until no item is running.
    pub fn wait_running(&self) {
        let mut st = self.shared.state.lock();
        while !st.working.is_empty() {
            self.shared.cond.wait(&mut st);
        }
    }

    /// Block until nothing is queued, forced or running.
    pub fn wait_until_done(&self) {
        let mut st = self.shared.state.lock();
        while !(st.working.is_empty() && st.queue.is_empty() && st.force.is_empty()) {
            self.shared.cond.wait(&mut st);
        }
    }
}
