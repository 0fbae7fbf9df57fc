//! Instance-scoped subscriber lists.
//!
//! Each component that publishes an event owns a [`Subscribers`] list. The
//! list lock is held only while registering, removing or copying handlers;
//! handlers themselves always run with no lock held, so a handler may freely
//! subscribe, unsubscribe or call back into the publisher.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A registered event handler.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies a subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

struct Entry<E> {
    id: SubscriptionId,
    handler: Handler<E>,
    once: bool,
}

/// Thread-safe list of handlers for one event kind.
pub struct Subscribers<E> {
    entries: Mutex<Vec<Entry<E>>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that fires on every emission.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        self.push(Arc::new(handler), false)
    }

    /// Register a handler that is removed after the first emission it sees.
    pub fn subscribe_once(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        self.push(Arc::new(handler), true)
    }

    fn push(&self, handler: Handler<E>, once: bool) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.lock().push(Entry { id, handler, once });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler with `event`, returning how many ran.
    ///
    /// One-shot handlers are detached before any handler runs, so a handler
    /// that re-emits cannot trigger a one-shot twice.
    pub fn emit(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = {
            let mut entries = self.entries.lock();
            let handlers = entries.iter().map(|entry| entry.handler.clone()).collect();
            entries.retain(|entry| !entry.once);
            handlers
        };

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_handlers() {
        let subs: Subscribers<u32> = Subscribers::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            subs.subscribe(move |n| {
                total.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }
        assert_eq!(subs.emit(&2), 3);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_once_handler_fires_once() {
        let subs: Subscribers<()> = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        subs.subscribe_once(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        subs.emit(&());
        subs.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let subs: Subscribers<()> = Subscribers::new();
        let id = subs.subscribe(|_| {});
        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        assert_eq!(subs.emit(&()), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let subs: Arc<Subscribers<()>> = Arc::new(Subscribers::new());
        let inner = subs.clone();
        subs.subscribe_once(move |_| {
            inner.subscribe(|_| {});
        });
        // Would deadlock if the list lock were held across handler calls.
        assert_eq!(subs.emit(&()), 1);
        assert_eq!(subs.len(), 1);
    }
}
