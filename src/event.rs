//! Per-instance event registry
//!
//! Every policy instance owns one [`EventPublisher`]. Subscribers register a
//! handler for a specific event kind or for every event. Handlers run
//! synchronously, in registration order, on the thread that published the
//! event (the calling task, or the worker thread for a thread-pool bulkhead),
//! and never while a policy lock is held.
//!
//! Handlers run inline with the protected call, so they must not block.
//!
//! # Example
//!
//! ```
//! use bulwark::bulkhead::{Bulkhead, BulkheadConfig, BulkheadEventKind};
//! use bulwark::Policy;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let bulkhead = Bulkhead::new("db", BulkheadConfig::default()).unwrap();
//! let rejected = Arc::new(AtomicUsize::new(0));
//! let counter = rejected.clone();
//! bulkhead.events().on(BulkheadEventKind::CallRejected, move |_| {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// An event record published by a policy.
pub trait PolicyEvent: fmt::Debug + Send + Sync {
    /// Discriminant used to route the event to kind-specific handlers
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;

    fn policy_name(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;
}

type Handler<Ev> = Arc<dyn Fn(&Ev) + Send + Sync>;

struct Registry<Ev: PolicyEvent> {
    by_kind: HashMap<Ev::Kind, Vec<Handler<Ev>>>,
    any: Vec<Handler<Ev>>,
}

/// Registry mapping event kind to an ordered handler list.
pub struct EventPublisher<Ev: PolicyEvent> {
    registry: RwLock<Registry<Ev>>,
}

impl<Ev: PolicyEvent> EventPublisher<Ev> {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                by_kind: HashMap::new(),
                any: Vec::new(),
            }),
        }
    }

    /// Subscribe to a single kind of event
    pub fn on<F>(&self, kind: Ev::Kind, handler: F)
    where
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        self.registry
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Subscribe to every event published by this instance
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        self.registry.write().any.push(Arc::new(handler));
    }

    /// Whether any handler would receive an event of `kind`
    pub fn has_subscribers(&self, kind: Ev::Kind) -> bool {
        let registry = self.registry.read();
        !registry.any.is_empty()
            || registry
                .by_kind
                .get(&kind)
                .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Invoke the handlers registered for this event, kind-specific first.
    ///
    /// The handler list is copied out before invocation so a handler may
    /// subscribe further handlers without deadlocking.
    pub fn publish(&self, event: &Ev) {
        let handlers: Vec<Handler<Ev>> = {
            let registry = self.registry.read();
            registry
                .by_kind
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .cloned()
                .collect()
        };

        for handler in handlers {
            handler(event);
        }
    }
}

impl<Ev: PolicyEvent> Default for EventPublisher<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ev: PolicyEvent> fmt::Debug for EventPublisher<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("EventPublisher")
            .field("kinds", &registry.by_kind.keys().collect::<Vec<_>>())
            .field("catch_all", &registry.any.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestKind {
        Ping,
        Pong,
    }

    #[derive(Debug)]
    struct TestEvent {
        kind: TestKind,
        at: DateTime<Utc>,
    }

    impl PolicyEvent for TestEvent {
        type Kind = TestKind;

        fn kind(&self) -> TestKind {
            self.kind
        }

        fn policy_name(&self) -> &str {
            "test"
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn event(kind: TestKind) -> TestEvent {
        TestEvent {
            kind,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_routes_by_kind_in_registration_order() {
        let publisher: EventPublisher<TestEvent> = EventPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        publisher.on(TestKind::Ping, move |_| s.lock().push("ping-1"));
        let s = seen.clone();
        publisher.on(TestKind::Ping, move |_| s.lock().push("ping-2"));
        let s = seen.clone();
        publisher.on(TestKind::Pong, move |_| s.lock().push("pong"));
        let s = seen.clone();
        publisher.on_event(move |e: &TestEvent| {
            let label = match e.kind {
                TestKind::Ping => "any-ping",
                TestKind::Pong => "any-pong",
            };
            s.lock().push(label);
        });

        publisher.publish(&event(TestKind::Ping));
        assert_eq!(*seen.lock(), vec!["ping-1", "ping-2", "any-ping"]);

        seen.lock().clear();
        publisher.publish(&event(TestKind::Pong));
        assert_eq!(*seen.lock(), vec!["pong", "any-pong"]);
    }

    #[test]
    fn test_has_subscribers() {
        let publisher: EventPublisher<TestEvent> = EventPublisher::new();
        assert!(!publisher.has_subscribers(TestKind::Ping));

        publisher.on(TestKind::Pong, |_| {});
        assert!(!publisher.has_subscribers(TestKind::Ping));
        assert!(publisher.has_subscribers(TestKind::Pong));

        publisher.on_event(|_| {});
        assert!(publisher.has_subscribers(TestKind::Ping));
    }

    #[test]
    fn test_handler_may_subscribe_while_publishing() {
        let publisher: Arc<EventPublisher<TestEvent>> = Arc::new(EventPublisher::new());
        let inner = publisher.clone();
        publisher.on(TestKind::Ping, move |_| {
            inner.on(TestKind::Pong, |_| {});
        });

        publisher.publish(&event(TestKind::Ping));
        assert!(publisher.has_subscribers(TestKind::Pong));
    }
}
