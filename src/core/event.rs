//! Publish/subscribe primitive used for lifecycle notifications.
//!
//! An [`Event`] keeps two kinds of subscribers:
//!
//! - **strong** subscribers registered with [`Event::connect`], kept alive by the event;
//! - **weak** subscribers registered with [`Event::listen`], dropped automatically once the
//!   last strong reference to the handler goes away.
//!
//! Subscribers are identified by their `Arc` allocation, so the same handler cannot be
//! subscribed twice. Arguments a subscriber needs beyond the emitted value are captured by
//! the closure itself.
//!
//! ```
//! use hostqueue::core::event::{handler, Event};
//!
//! let event: Event<u32, u32> = Event::new();
//! let double = handler(|n: &u32| Some(n * 2));
//! event.connect(&double).unwrap();
//! assert_eq!(event.emit(&21), Some(42));
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::error::EventError;

/// A subscriber callback. Returning `Some` stops the emission and becomes its result.
pub type Handler<A, R = ()> = Arc<dyn Fn(&A) -> Option<R> + Send + Sync>;

type WeakHandler<A, R> = Weak<dyn Fn(&A) -> Option<R> + Send + Sync>;

/// Wrap a closure into a [`Handler`].
pub fn handler<A, R, F>(f: F) -> Handler<A, R>
where
    F: Fn(&A) -> Option<R> + Send + Sync + 'static,
{
    Arc::new(f)
}

enum Subscriber<A, R> {
    Strong(Handler<A, R>),
    Weak(WeakHandler<A, R>),
}

impl<A, R> Subscriber<A, R> {
    fn addr(&self) -> *const () {
        match self {
            Self::Strong(h) => Arc::as_ptr(h).cast::<()>(),
            Self::Weak(w) => w.as_ptr().cast::<()>(),
        }
    }

    const fn is_weak(&self) -> bool {
        matches!(self, Self::Weak(_))
    }

    fn is_alive(&self) -> bool {
        match self {
            Self::Strong(_) => true,
            Self::Weak(w) => w.strong_count() > 0,
        }
    }

    fn upgrade(&self) -> Option<Handler<A, R>> {
        match self {
            Self::Strong(h) => Some(Arc::clone(h)),
            Self::Weak(w) => w.upgrade(),
        }
    }
}

fn addr_of<A, R>(handler: &Handler<A, R>) -> *const () {
    Arc::as_ptr(handler).cast::<()>()
}

/// A publish/subscribe event carrying `A` and optionally short-circuiting with `R`.
pub struct Event<A, R = ()> {
    subscribers: Mutex<Vec<Subscriber<A, R>>>,
}

impl<A, R> Default for Event<A, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R> std::fmt::Debug for Event<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl<A, R> Event<A, R> {
    /// Create an event without subscribers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe `handler` and keep it alive for as long as it stays connected.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::AlreadyConnected`] if the handler is subscribed already,
    /// strongly or weakly.
    pub fn connect(&self, handler: &Handler<A, R>) -> Result<(), EventError> {
        let mut subs = self.subscribers.lock();
        let addr = addr_of(handler);
        if subs.iter().any(|s| s.is_alive() && s.addr() == addr) {
            return Err(EventError::AlreadyConnected);
        }
        subs.push(Subscriber::Strong(Arc::clone(handler)));
        Ok(())
    }

    /// Subscribe `handler` without keeping it alive.
    ///
    /// The subscription ends silently once every strong reference to the handler has been
    /// dropped; later emissions skip it.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::AlreadyConnected`] if the handler is already listening.
    pub fn listen(&self, handler: &Handler<A, R>) -> Result<(), EventError> {
        let mut subs = self.subscribers.lock();
        subs.retain(Subscriber::is_alive);
        let addr = addr_of(handler);
        if subs.iter().any(|s| s.is_weak() && s.addr() == addr) {
            return Err(EventError::AlreadyConnected);
        }
        subs.push(Subscriber::Weak(Arc::downgrade(handler)));
        Ok(())
    }

    /// Whether `handler` is currently subscribed.
    pub fn is_connected(&self, handler: &Handler<A, R>) -> bool {
        let addr = addr_of(handler);
        self.subscribers
            .lock()
            .iter()
            .any(|s| s.is_alive() && s.addr() == addr)
    }

    /// Number of live subscribers. Dead weak subscribers are pruned first.
    pub fn n_subscribers(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(Subscriber::is_alive);
        subs.len()
    }

    /// Remove `handler`. Returns whether it was subscribed.
    pub fn disconnect(&self, handler: &Handler<A, R>) -> bool {
        let addr = addr_of(handler);
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.is_alive() && s.addr() != addr);
        before != subs.len()
    }

    /// Remove every subscriber.
    pub fn disconnect_all(&self) {
        self.subscribers.lock().clear();
    }

    /// Call every live subscriber with `args`.
    ///
    /// Returns the first `Some` produced by a subscriber; the remaining subscribers are not
    /// called. Subscribers run outside the event's lock, so they may connect, disconnect or
    /// emit themselves.
    pub fn emit(&self, args: &A) -> Option<R> {
        let live: Vec<Handler<A, R>> = {
            let mut subs = self.subscribers.lock();
            subs.retain(Subscriber::is_alive);
            subs.iter().filter_map(Subscriber::upgrade).collect()
        };
        live.into_iter().find_map(|h| h(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counter() -> (Arc<AtomicUsize>, Handler<u32>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb = handler(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
            None
        });
        (hits, cb)
    }

    #[test]
    fn test_connect_twice_fails() {
        let event: Event<u32> = Event::new();
        let (_, cb) = counter();
        event.connect(&cb).unwrap();
        assert_eq!(event.connect(&cb), Err(EventError::AlreadyConnected));
        assert_eq!(event.n_subscribers(), 1);
    }

    #[test]
    fn test_connect_after_listen_fails() {
        let event: Event<u32> = Event::new();
        let (_, cb) = counter();
        event.listen(&cb).unwrap();
        assert_eq!(event.connect(&cb), Err(EventError::AlreadyConnected));
        assert_eq!(event.listen(&cb), Err(EventError::AlreadyConnected));
    }

    #[test]
    fn test_disconnected_handler_not_called() {
        let event: Event<u32> = Event::new();
        let (hits, cb) = counter();
        event.connect(&cb).unwrap();
        event.emit(&1);
        assert!(event.disconnect(&cb));
        event.emit(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!event.is_connected(&cb));
    }

    #[test]
    fn test_first_result_short_circuits() {
        let event: Event<u32, &'static str> = Event::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&calls);
        let first = handler(move |_: &u32| {
            c1.fetch_add(1, Ordering::SeqCst);
            None
        });
        let second = handler(|n: &u32| (*n > 1).then_some("stop"));
        let c3 = Arc::clone(&calls);
        let third = handler(move |_: &u32| {
            c3.fetch_add(1, Ordering::SeqCst);
            Some("late")
        });
        event.connect(&first).unwrap();
        event.connect(&second).unwrap();
        event.connect(&third).unwrap();

        assert_eq!(event.emit(&5), Some("stop"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(event.emit(&0), Some("late"));
    }

    #[test]
    fn test_weak_subscriber_is_dropped() {
        let event: Event<u32> = Event::new();
        let (hits, cb) = counter();
        event.listen(&cb).unwrap();
        event.emit(&1);
        assert_eq!(event.n_subscribers(), 1);

        drop(cb);
        assert!(event.emit(&2).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(event.n_subscribers(), 0);
    }

    #[test]
    fn test_subscriber_dying_during_emission() {
        let event = Arc::new(Event::<u32>::new());
        let mut handlers = Vec::new();
        for _ in 0..50 {
            let (_, cb) = counter();
            event.listen(&cb).unwrap();
            handlers.push(cb);
        }
        let emitter = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                for i in 0..200 {
                    event.emit(&i);
                }
            })
        };
        while let Some(cb) = handlers.pop() {
            drop(cb);
            thread::yield_now();
        }
        emitter.join().unwrap();
        assert_eq!(event.n_subscribers(), 0);
    }

    #[test]
    fn test_handler_may_disconnect_itself() {
        let event = Arc::new(Event::<u32>::new());
        let slot: Arc<Mutex<Option<Handler<u32>>>> = Arc::new(Mutex::new(None));
        let ev = Arc::clone(&event);
        let own = Arc::clone(&slot);
        let cb = handler(move |_: &u32| {
            if let Some(me) = own.lock().take() {
                ev.disconnect(&me);
            }
            None
        });
        *slot.lock() = Some(Arc::clone(&cb));
        event.connect(&cb).unwrap();
        event.emit(&1);
        assert_eq!(event.n_subscribers(), 0);
    }
}
