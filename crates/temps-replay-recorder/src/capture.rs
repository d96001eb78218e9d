//! Capture source seam
//!
//! The recorder does not instrument anything itself. A [`CaptureSource`]
//! pushes events into a registered callback and produces full snapshots on
//! request.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::event::CapturedEvent;

/// Receives `(event, is_checkout)` from the capture source
pub type EventCallback = Arc<dyn Fn(CapturedEvent, bool) + Send + Sync>;

/// Handle for an attached callback. Not `Clone`, so it can only be detached once.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "dropping a subscription without detaching leaks the listener"]
pub struct Subscription {
    id: u64,
}

impl Subscription {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub trait CaptureSource: Send + Sync {
    fn attach(&self, callback: EventCallback) -> Subscription;

    fn detach(&self, subscription: Subscription);

    /// Take a full snapshot of the monitored surface
    fn take_checkout(&self, timestamp: i64) -> CapturedEvent;
}

type SnapshotFn = Box<dyn Fn() -> Value + Send + Sync>;

/// Capture source driven by the host: it calls [`emit`](Self::emit) for every
/// observed event and supplies snapshots through a closure.
pub struct ManualCaptureSource {
    listeners: Mutex<HashMap<u64, EventCallback>>,
    next_id: AtomicU64,
    snapshot: SnapshotFn,
}

impl ManualCaptureSource {
    pub fn new<F>(snapshot: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            snapshot: Box::new(snapshot),
        }
    }

    /// Deliver an event to every attached listener
    pub fn emit(&self, event: CapturedEvent, is_checkout: bool) {
        // callbacks run outside the lock so they may attach/detach
        let callbacks: Vec<EventCallback> = self.listeners.lock().values().cloned().collect();
        for callback in callbacks {
            callback(event.clone(), is_checkout);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for ManualCaptureSource {
    fn default() -> Self {
        Self::new(|| Value::Object(Default::default()))
    }
}

impl CaptureSource for ManualCaptureSource {
    fn attach(&self, callback: EventCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(id, callback);
        debug!("Attached capture listener {}", id);
        Subscription::new(id)
    }

    fn detach(&self, subscription: Subscription) {
        if self.listeners.lock().remove(&subscription.id()).is_some() {
            debug!("Detached capture listener {}", subscription.id());
        }
    }

    fn take_checkout(&self, timestamp: i64) -> CapturedEvent {
        CapturedEvent::checkout(timestamp, (self.snapshot)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_emit_reaches_attached_listeners() {
        let source = ManualCaptureSource::default();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = received.clone();

        let callback: EventCallback = Arc::new(move |event: CapturedEvent, is_checkout: bool| {
            sink.lock().unwrap().push((event.timestamp, is_checkout));
        });
        let subscription = source.attach(callback);
        assert_eq!(source.listener_count(), 1);

        source.emit(CapturedEvent::incremental(1, json!({})), false);
        source.emit(CapturedEvent::checkout(2, json!({})), true);
        assert_eq!(*received.lock().unwrap(), vec![(1, false), (2, true)]);

        source.detach(subscription);
        assert_eq!(source.listener_count(), 0);

        source.emit(CapturedEvent::incremental(3, json!({})), false);
        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_subscriptions_are_unique() {
        let source = ManualCaptureSource::default();
        let first = source.attach(Arc::new(|_: CapturedEvent, _: bool| {}));
        let second = source.attach(Arc::new(|_: CapturedEvent, _: bool| {}));

        assert_ne!(first.id(), second.id());
        source.detach(first);
        source.detach(second);
        assert_eq!(source.listener_count(), 0);
    }

    #[test]
    fn test_take_checkout_uses_snapshot() {
        let source = ManualCaptureSource::new(|| json!({"node": "root"}));
        let event = source.take_checkout(99);

        assert!(event.is_checkout());
        assert_eq!(event.timestamp, 99);
        assert_eq!(event.data["node"], "root");
    }
}
