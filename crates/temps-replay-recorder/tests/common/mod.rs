//! Shared test doubles for the controller integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use temps_replay_recorder::{
    CapturedEvent, ManualCaptureSource, ManualClock, MemorySessionStore, RecordingPayload,
    ReplayConfig, ReplayController, ReplayDependencies, ReplayTransport, TransportError,
};
use tokio::sync::Semaphore;

pub const START_MILLIS: i64 = 1_700_000_000_000;
pub const MIN_DELAY_MS: u64 = 1_000;
pub const MAX_DELAY_MS: u64 = 3_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport that records payloads, can be told to fail and can hold sends
/// until permits are released
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<RecordingPayload>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends block until [`release`](Self::release) hands out permits
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        }
    }

    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RecordingPayload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplayTransport for MockTransport {
    async fn send(&self, payload: &RecordingPayload) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?
                .forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Http("collector unreachable".to_string()));
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "mock"
    }
}

pub struct Harness {
    pub controller: ReplayController,
    pub capture: Arc<ManualCaptureSource>,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemorySessionStore>,
}

pub fn test_config() -> ReplayConfig {
    ReplayConfig {
        min_flush_delay_ms: MIN_DELAY_MS,
        max_flush_delay_ms: MAX_DELAY_MS,
        ..Default::default()
    }
}

pub fn harness(config: ReplayConfig, transport: MockTransport) -> Harness {
    harness_with_store(config, transport, MemorySessionStore::new())
}

pub fn harness_with_store(
    config: ReplayConfig,
    transport: MockTransport,
    store: MemorySessionStore,
) -> Harness {
    init_tracing();
    let capture = Arc::new(ManualCaptureSource::new(|| {
        serde_json::json!({"node": {"type": 0, "childNodes": []}})
    }));
    let transport = Arc::new(transport);
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let store = Arc::new(store);

    let deps = ReplayDependencies::new(capture.clone(), transport.clone(), store.clone())
        .with_clock(clock.clone());
    let controller = ReplayController::new(config, deps).unwrap();

    Harness {
        controller,
        capture,
        transport,
        clock,
        store,
    }
}

pub fn events(payload: &RecordingPayload) -> Vec<CapturedEvent> {
    serde_json::from_str(&payload.recording_data).unwrap()
}

pub fn incremental(timestamp: i64) -> CapturedEvent {
    CapturedEvent::incremental(timestamp, serde_json::json!({"source": 2, "type": 1}))
}

pub fn checkout(timestamp: i64) -> CapturedEvent {
    CapturedEvent::checkout(timestamp, serde_json::json!({"node": {"type": 0}}))
}

/// Let spawned tasks run to their next suspension point
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Advance paused time and let timers and flushes complete
pub async fn wait_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

/// Wait past the debounce delay
pub async fn wait_for_flush() {
    wait_ms(MIN_DELAY_MS + 1).await;
}
