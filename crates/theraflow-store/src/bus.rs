//! Change notification bus.
//!
//! Signals "this collection changed" so consumers can re-read the caches.
//! Handlers run synchronously on the publishing thread, in registration
//! order. The set of handlers for a publish is fixed when delivery starts:
//! a handler registered during delivery is not called for that publish, and
//! a handler unsubscribed during delivery is skipped if it has not run yet.
//!
//! Async consumers can use [`ChangeBus::receiver`] instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of the async change channel.
pub const DEFAULT_CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Change topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The patient cache changed.
    PatientsChanged,
    /// The session cache changed.
    SessionsChanged,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::PatientsChanged => write!(f, "patients-changed"),
            Topic::SessionsChanged => write!(f, "sessions-changed"),
        }
    }
}

/// Handle returned by [`ChangeBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(Topic) + Send + Sync>;

struct Registration {
    id: HandlerId,
    topic: Topic,
    handler: Handler,
    active: Arc<AtomicBool>,
}

/// In-process publish/subscribe for cache change events.
pub struct ChangeBus {
    next_id: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
    events_tx: broadcast::Sender<Topic>,
}

impl ChangeBus {
    /// Create a bus with the default async channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CHANNEL_CAPACITY)
    }

    /// Create a bus whose async channel holds up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
            events_tx,
        }
    }

    /// Register a handler for a topic.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(Topic) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                topic,
                handler: Arc::new(handler),
                active: Arc::new(AtomicBool::new(true)),
            });
        trace!(topic = %topic, handler = id.0, "bus: handler subscribed");
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match handlers.iter().position(|r| r.id == id) {
            Some(index) => {
                let registration = handlers.remove(index);
                registration.active.store(false, Ordering::SeqCst);
                trace!(topic = %registration.topic, handler = id.0, "bus: handler unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Queue `topic` for async receivers, then deliver it to every handler
    /// subscribed to it. Receivers see nested publishes after the outer one.
    pub fn publish(&self, topic: Topic) {
        if self.events_tx.send(topic).is_err() {
            trace!(topic = %topic, "no receivers for change event");
        }

        let targets: Vec<(Handler, Arc<AtomicBool>)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.topic == topic)
            .map(|r| (Arc::clone(&r.handler), Arc::clone(&r.active)))
            .collect();

        for (handler, active) in targets {
            if active.load(Ordering::SeqCst) {
                handler(topic);
            }
        }
    }

    /// Receive change events asynchronously.
    pub fn receiver(&self) -> broadcast::Receiver<Topic> {
        self.events_tx.subscribe()
    }

    /// Number of handlers registered for a topic.
    pub fn handler_count(&self, topic: Topic) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.topic == topic)
            .count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(Topic) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |name: &str| -> Box<dyn Fn(Topic) + Send + Sync> {
            let log = Arc::clone(&log_for_factory);
            let name = name.to_string();
            Box::new(move |topic| log.lock().unwrap().push(format!("{}:{}", name, topic)))
        };
        (log, factory)
    }

    #[test]
    fn test_publish_in_registration_order() {
        let bus = ChangeBus::new();
        let (log, handler) = recorder();

        bus.subscribe(Topic::PatientsChanged, handler("a"));
        bus.subscribe(Topic::PatientsChanged, handler("b"));
        bus.subscribe(Topic::SessionsChanged, handler("c"));

        bus.publish(Topic::PatientsChanged);
        bus.publish(Topic::SessionsChanged);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:patients-changed",
                "b:patients-changed",
                "c:sessions-changed"
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ChangeBus::new();
        let (log, handler) = recorder();

        let id = bus.subscribe(Topic::PatientsChanged, handler("a"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(Topic::PatientsChanged);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.handler_count(Topic::PatientsChanged), 0);
    }

    #[test]
    fn test_handler_registered_during_delivery_waits_for_next_publish() {
        let bus = Arc::new(ChangeBus::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let bus_inner = Arc::clone(&bus);
        let calls_inner = Arc::clone(&calls);
        bus.subscribe(Topic::PatientsChanged, move |_| {
            calls_inner.lock().unwrap().push("outer");
            let calls_late = Arc::clone(&calls_inner);
            bus_inner.subscribe(Topic::PatientsChanged, move |_| {
                calls_late.lock().unwrap().push("late");
            });
        });

        bus.publish(Topic::PatientsChanged);
        assert_eq!(*calls.lock().unwrap(), vec!["outer"]);

        bus.publish(Topic::PatientsChanged);
        assert_eq!(*calls.lock().unwrap(), vec!["outer", "outer", "late"]);
    }

    #[test]
    fn test_handler_unsubscribed_during_delivery_is_skipped() {
        let bus = Arc::new(ChangeBus::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let victim = Arc::new(Mutex::new(None::<HandlerId>));

        let bus_inner = Arc::clone(&bus);
        let victim_inner = Arc::clone(&victim);
        let calls_first = Arc::clone(&calls);
        bus.subscribe(Topic::SessionsChanged, move |_| {
            calls_first.lock().unwrap().push("first");
            if let Some(id) = *victim_inner.lock().unwrap() {
                bus_inner.unsubscribe(id);
            }
        });

        let calls_second = Arc::clone(&calls);
        let id = bus.subscribe(Topic::SessionsChanged, move |_| {
            calls_second.lock().unwrap().push("second");
        });
        *victim.lock().unwrap() = Some(id);

        bus.publish(Topic::SessionsChanged);
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_reentrant_publish() {
        let bus = Arc::new(ChangeBus::new());
        let mut rx = bus.receiver();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let bus_inner = Arc::clone(&bus);
        let calls_patients = Arc::clone(&calls);
        bus.subscribe(Topic::PatientsChanged, move |t| {
            calls_patients.lock().unwrap().push(t);
            bus_inner.publish(Topic::SessionsChanged);
        });
        let calls_sessions = Arc::clone(&calls);
        bus.subscribe(Topic::SessionsChanged, move |t| {
            calls_sessions.lock().unwrap().push(t);
        });

        bus.publish(Topic::PatientsChanged);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Topic::PatientsChanged, Topic::SessionsChanged]
        );

        // Receivers see the same order as handlers.
        assert_eq!(rx.try_recv().unwrap(), Topic::PatientsChanged);
        assert_eq!(rx.try_recv().unwrap(), Topic::SessionsChanged);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_receiver_gets_events() {
        let bus = ChangeBus::new();
        let mut rx = bus.receiver();

        bus.publish(Topic::PatientsChanged);
        bus.publish(Topic::SessionsChanged);

        assert_eq!(rx.try_recv().unwrap(), Topic::PatientsChanged);
        assert_eq!(rx.try_recv().unwrap(), Topic::SessionsChanged);
        assert!(rx.try_recv().is_err());
    }
}
