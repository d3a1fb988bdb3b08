//! Integration tests for the event bus as used across threads.
//!
//! These tests validate:
//! - Duplicate subscriptions are rejected
//! - Weak subscribers disappear with their last strong reference
//! - Emission from many threads reaches every live subscriber

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use hostqueue::core::{handler, Event, EventError, Handler};

#[test]
fn test_duplicate_subscription_rejected() {
    let event: Event<u32> = Event::new();
    let cb: Handler<u32> = handler(|_: &u32| None);
    event.listen(&cb).unwrap();
    assert_eq!(event.connect(&cb), Err(EventError::AlreadyConnected));
    assert_eq!(event.listen(&cb), Err(EventError::AlreadyConnected));
    assert_eq!(event.n_subscribers(), 1);
}

#[test]
fn test_weak_subscriber_collected() {
    let event: Event<u32> = Event::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let h = Arc::clone(&hits);
        let cb: Handler<u32> = handler(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
            None
        });
        event.listen(&cb).unwrap();
        event.emit(&1);
    }
    event.emit(&2);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(event.n_subscribers(), 0);
}

#[test]
fn test_concurrent_emission() {
    let event: Arc<Event<usize>> = Arc::new(Event::new());
    let total = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&total);
    let cb: Handler<usize> = handler(move |n: &usize| {
        t.fetch_add(*n, Ordering::SeqCst);
        None
    });
    event.connect(&cb).unwrap();

    let emitters: Vec<_> = (0..4)
        .map(|_| {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                for _ in 0..100 {
                    event.emit(&1);
                }
            })
        })
        .collect();
    for emitter in emitters {
        emitter.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 400);
}
