//! Reorganization notifications.
//!
//! Handlers run synchronously on the organizing thread, after the new
//! chain is persisted. A handler that returns [`Subscription::Drop`] is
//! removed; [`Subscriber::unsubscribe`] does the same from outside.
//! Handlers must not call back into the subscriber they are registered
//! with.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::Block;

pub type SubscriptionId = u64;

/// A completed reorganization. `arrivals` are now canonical from
/// `fork_height + 1` upward, `replaced` were canonical there before.
/// Both are oldest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reorganization {
    pub fork_height: u64,
    pub arrivals: Vec<Arc<Block>>,
    pub replaced: Vec<Arc<Block>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReorganizeEvent {
    Reorganized(Reorganization),
    /// The organizer stopped. This is the last event a handler sees.
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subscription {
    Keep,
    Drop,
}

type Handler = Box<dyn FnMut(&ReorganizeEvent) -> Subscription + Send>;

pub struct Subscriber {
    handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&ReorganizeEvent) -> Subscription + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, Box::new(handler)));
        id
    }

    /// `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Deliver `event` to every handler, in subscription order.
    pub fn relay(&self, event: &ReorganizeEvent) {
        self.handlers
            .lock()
            .retain_mut(|(_, handler)| handler(event) == Subscription::Keep);
    }

    /// Send [`ReorganizeEvent::Stopped`] and drop every handler.
    pub fn stop(&self) {
        let mut handlers = std::mem::take(&mut *self.handlers.lock());
        for (_, handler) in handlers.iter_mut() {
            handler(&ReorganizeEvent::Stopped);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(fork_height: u64) -> ReorganizeEvent {
        ReorganizeEvent::Reorganized(Reorganization {
            fork_height,
            arrivals: vec![],
            replaced: vec![],
        })
    }

    #[test]
    fn handlers_can_drop_themselves() {
        let subscriber = Subscriber::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        subscriber.subscribe(move |event| {
            log.lock().push(event.clone());
            Subscription::Drop
        });
        let counter = Arc::new(AtomicU64::new(0));
        let count = Arc::clone(&counter);
        subscriber.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Subscription::Keep
        });

        subscriber.relay(&event(1));
        subscriber.relay(&event(2));
        assert_eq!(*seen.lock(), vec![event(1)]);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(subscriber.len(), 1);
    }

    #[test]
    fn unsubscribe_and_stop() {
        let subscriber = Subscriber::new();
        let stopped = Arc::new(AtomicU64::new(0));

        let a = subscriber.subscribe(|_| Subscription::Keep);
        let flag = Arc::clone(&stopped);
        subscriber.subscribe(move |event| {
            if *event == ReorganizeEvent::Stopped {
                flag.fetch_add(1, Ordering::SeqCst);
            }
            Subscription::Keep
        });

        assert!(subscriber.unsubscribe(a));
        assert!(!subscriber.unsubscribe(a));
        subscriber.stop();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(subscriber.is_empty());
    }
}
