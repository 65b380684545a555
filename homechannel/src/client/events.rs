//! Connection Events
//!
//! A fixed set of event kinds, each with an ordered subscriber list.
//! Dispatch is synchronous and in registration order; a panicking subscriber
//! is logged and skipped, the remaining subscribers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use super::state::ConnectionState;
use crate::error::ErrorKind;

/// Event kinds subscribers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    Connected,
    Disconnected,
    Error,
}

/// Connection lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    Disconnected {
        reason: Option<String>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Ordered, panic-isolated event dispatch
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber for `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every subscriber of its kind, in order.
    ///
    /// Returns how many subscribers completed without panicking.
    pub fn emit(&self, event: &ConnectionEvent) -> usize {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("[events] subscriber panicked on {:?}", event.kind()),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            bus.subscribe(EventKind::Connected, move |_| log.lock().push(i));
        }
        assert_eq!(bus.emit(&ConnectionEvent::Connected), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h1 = hits.clone();
        bus.subscribe(EventKind::Error, move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(EventKind::Error, |_| panic!("subscriber bug"));
        let h3 = hits.clone();
        bus.subscribe(EventKind::Error, move |_| {
            h3.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.emit(&ConnectionEvent::Error {
            kind: ErrorKind::Transport,
            message: "timeout".into(),
        });
        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kinds_are_separate() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        bus.subscribe(EventKind::Disconnected, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&ConnectionEvent::Connected);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.emit(&ConnectionEvent::Disconnected { reason: None });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::Connected, |_| {});
        assert_eq!(bus.subscriber_count(EventKind::Connected), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.emit(&ConnectionEvent::Connected), 0);
    }
}
