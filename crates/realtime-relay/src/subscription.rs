//! Event subscriptions and dispatch.
//!
//! The caller owns each [`EventSubscription`]. The registry only keeps a weak
//! reference, so dropping a handle ends its subscription as well.

use crate::messages::{Event, EventType};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives events accepted by its subscription's filter.
///
/// Handlers run on the realtime client's task, one at a time, so they should
/// return quickly.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Which event types a subscription accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(BTreeSet<EventType>),
}

impl EventFilter {
    /// An empty set of types accepts everything.
    pub fn only<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        let types: BTreeSet<EventType> = types.into_iter().map(Into::into).collect();
        if types.is_empty() {
            EventFilter::All
        } else {
            EventFilter::Only(types)
        }
    }

    pub fn matches(&self, event_type: &EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(types) => types.contains(event_type),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct SubscriptionInner {
    id: SubscriptionId,
    registry: u64,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
    active: AtomicBool,
    // Held for the length of one handler invocation.
    in_flight: Mutex<()>,
}

impl SubscriptionInner {
    /// Returns false if already inactive.
    fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        // From inside a handler of the same registry the dispatcher is this
        // thread, so it will see the flag before its next invocation.
        // Elsewhere, wait out any invocation in progress so none starts or
        // runs after we return.
        if DISPATCHING.with(Cell::get) != self.registry {
            drop(self.in_flight.lock());
        }
        was_active
    }
}

/// Caller-owned subscription handle.
pub struct EventSubscription {
    inner: Arc<SubscriptionInner>,
}

impl EventSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn filter(&self) -> &EventFilter {
        &self.inner.filter
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.inner.id)
            .field("filter", &self.inner.filter)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Id of the registry dispatching on this thread, 0 if none.
    static DISPATCHING: Cell<u64> = const { Cell::new(0) };
}

struct DispatchScope {
    previous: u64,
}

impl DispatchScope {
    fn enter(registry: u64) -> Self {
        Self {
            previous: DISPATCHING.with(|d| d.replace(registry)),
        }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        let previous = self.previous;
        DISPATCHING.with(|d| d.set(previous));
    }
}

/// Subscriptions in registration order.
pub(crate) struct SubscriptionRegistry {
    id: u64,
    next_id: AtomicU64,
    entries: RwLock<Vec<Weak<SubscriptionInner>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn register(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> EventSubscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let inner = Arc::new(SubscriptionInner {
            id,
            registry: self.id,
            filter,
            handler,
            active: AtomicBool::new(true),
            in_flight: Mutex::new(()),
        });

        let mut entries = self.entries.write();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(&inner));
        EventSubscription { inner }
    }

    /// Returns false if the subscription was already removed.
    pub(crate) fn remove(&self, subscription: &EventSubscription) -> bool {
        let was_active = subscription.inner.deactivate();
        self.entries.write().retain(|entry| match entry.upgrade() {
            Some(inner) => inner.id != subscription.inner.id,
            None => false,
        });
        was_active
    }

    /// Deactivate and forget every subscription.
    pub(crate) fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        for inner in entries.iter().filter_map(Weak::upgrade) {
            inner.deactivate();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Deliver `event` to every matching subscription in registration order.
    ///
    /// Works from a snapshot, so handlers may subscribe or unsubscribe while
    /// it runs. A failing handler is recorded and the rest still run.
    pub(crate) fn dispatch(&self, event: &Event) -> DispatchReport {
        let snapshot: Vec<Arc<SubscriptionInner>> = self
            .entries
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let _scope = DispatchScope::enter(self.id);
        let mut report = DispatchReport::default();

        for inner in snapshot {
            if !inner.filter.matches(event.event_type()) {
                continue;
            }

            let _guard = inner.in_flight.lock();
            if !inner.active.load(Ordering::SeqCst) {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| inner.handler.handle(event)));
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            report.delivered += 1;
            if let Some(error) = error {
                warn!(
                    subscription = %inner.id,
                    event_type = %event.event_type(),
                    error = %error,
                    "Event handler failed"
                );
                report.failures.push(HandlerFailure {
                    subscription: inner.id,
                    error,
                });
            }
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, 1, "s1", Utc::now(), json!({"n": 1}))
    }

    fn recorder() -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |event: &Event| -> Result<(), HandlerError> {
            sink.lock().push(event.event_type().to_string());
            Ok(())
        };
        (Arc::new(handler), seen)
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter::only(["sensor.opened", "lock.unlocked"]);
        assert!(filter.matches(&"sensor.opened".into()));
        assert!(!filter.matches(&"alarm.triggered".into()));

        let empty = EventFilter::only(Vec::<EventType>::new());
        assert_eq!(empty, EventFilter::All);
        assert!(empty.matches(&"anything".into()));
    }

    #[test]
    fn test_dispatch_follows_filters() {
        let registry = SubscriptionRegistry::new();
        let (opened, opened_seen) = recorder();
        let (all, all_seen) = recorder();
        let _a = registry.register(EventFilter::only(["sensor.opened"]), opened);
        let _b = registry.register(EventFilter::All, all);

        registry.dispatch(&event("sensor.opened"));
        registry.dispatch(&event("lock.unlocked"));

        assert_eq!(*opened_seen.lock(), vec!["sensor.opened"]);
        assert_eq!(*all_seen.lock(), vec!["sensor.opened", "lock.unlocked"]);
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..3 {
            let order = order.clone();
            let handler = move |_: &Event| -> Result<(), HandlerError> {
                order.lock().push(n);
                Ok(())
            };
            handles.push(registry.register(EventFilter::All, Arc::new(handler)));
        }

        registry.dispatch(&event("sensor.opened"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let registry = SubscriptionRegistry::new();
        let failing = |_: &Event| -> Result<(), HandlerError> { Err("boom".into()) };
        let panicking = |_: &Event| -> Result<(), HandlerError> { panic!("kaboom") };
        let (ok, seen) = recorder();

        let a = registry.register(EventFilter::All, Arc::new(failing));
        let b = registry.register(EventFilter::All, Arc::new(panicking));
        let _c = registry.register(EventFilter::All, ok);

        let report = registry.dispatch(&event("sensor.opened"));
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].subscription, a.id());
        assert_eq!(report.failures[0].error, "boom");
        assert_eq!(report.failures[1].subscription, b.id());
        assert!(report.failures[1].error.contains("kaboom"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (handler, seen) = recorder();
        let sub = registry.register(EventFilter::All, handler);

        assert!(registry.remove(&sub));
        assert!(!registry.remove(&sub));
        assert!(!sub.is_active());
        assert_eq!(registry.len(), 0);

        registry.dispatch(&event("sensor.opened"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_dropped_handle_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let (handler, seen) = recorder();
        let sub = registry.register(EventFilter::All, handler);
        drop(sub);

        registry.dispatch(&event("sensor.opened"));
        assert!(seen.lock().is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unsubscribe_from_inside_handler() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let later: Arc<Mutex<Option<EventSubscription>>> = Arc::new(Mutex::new(None));
        let (victim_handler, victim_seen) = recorder();

        let reg = registry.clone();
        let slot = later.clone();
        let remover = move |_: &Event| -> Result<(), HandlerError> {
            if let Some(sub) = slot.lock().as_ref() {
                reg.remove(sub);
            }
            Ok(())
        };

        let _first = registry.register(EventFilter::All, Arc::new(remover));
        *later.lock() = Some(registry.register(EventFilter::All, victim_handler));

        registry.dispatch(&event("sensor.opened"));
        assert!(victim_seen.lock().is_empty());
    }

    #[test]
    fn test_unsubscribe_self_from_inside_handler() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let own: Arc<Mutex<Option<EventSubscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let reg = registry.clone();
        let slot = own.clone();
        let count = calls.clone();
        let handler = move |_: &Event| -> Result<(), HandlerError> {
            count.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot.lock().as_ref() {
                assert!(reg.remove(sub));
            }
            Ok(())
        };
        *own.lock() = Some(registry.register(EventFilter::All, Arc::new(handler)));

        registry.dispatch(&event("sensor.opened"));
        registry.dispatch(&event("sensor.opened"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_from_other_registry_waits_for_running_handler() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let other = Arc::new(SubscriptionRegistry::new());
        let (started_tx, started_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let slow = move |_: &Event| -> Result<(), HandlerError> {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(100));
            done.store(true, Ordering::SeqCst);
            Ok(())
        };
        let target = Arc::new(other.register(EventFilter::All, Arc::new(slow)));

        let dispatcher = {
            let other = other.clone();
            thread::spawn(move || {
                other.dispatch(&event("sensor.opened"));
            })
        };
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("slow handler did not start");

        let registry = SubscriptionRegistry::new();
        let finished_at_return = Arc::new(Mutex::new(None));
        let observed = finished_at_return.clone();
        let remover = {
            let other = other.clone();
            let target = target.clone();
            let finished = finished.clone();
            move |_: &Event| -> Result<(), HandlerError> {
                other.remove(&target);
                *observed.lock() = Some(finished.load(Ordering::SeqCst));
                Ok(())
            }
        };
        let _remover = registry.register(EventFilter::All, Arc::new(remover));
        registry.dispatch(&event("lock.unlocked"));

        assert_eq!(*finished_at_return.lock(), Some(true));
        assert!(!target.is_active());
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_clear_deactivates_all() {
        let registry = SubscriptionRegistry::new();
        let (handler, _) = recorder();
        let a = registry.register(EventFilter::All, handler.clone());
        let b = registry.register(EventFilter::All, handler);

        registry.clear();
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert_eq!(registry.len(), 0);
    }
}
