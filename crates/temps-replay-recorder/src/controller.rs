//! Recording controller
//!
//! Top-level state machine of the recorder. It receives captured events,
//! routes them into the segment buffer, drives the flush timer and owns the
//! session and the capture subscription.
//!
//! ```text
//!            start()                 start_buffering()
//! Disabled ----------> Recording <--------------------> BufferingOnly
//!    ^                     |       start() promotes          |
//!    |       stop()        |                                  |
//!    +---------------------+----------------------------------+
//! ```
//!
//! All mutable state sits behind one synchronous lock that is never held
//! across an `.await`. A separate async lock represents the flush in flight,
//! which both the coalescing rule and [`ReplayController::stop`] wait on.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{AddOutcome, BufferMark, BufferState, EventBuffer};
use crate::capture::{CaptureSource, EventCallback, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::config::ReplayConfig;
use crate::error::ReplayResult;
use crate::event::CapturedEvent;
use crate::scheduler::FlushScheduler;
use crate::session::{Session, SessionManager};
use crate::storage::SessionStore;
use crate::transport::{RecordingPayload, ReplayTransport, SegmentHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    Disabled,
    /// Segments are flushed to the transport as they fill up
    Recording,
    /// Events are kept in memory only, waiting for a promotion to `Recording`
    BufferingOnly,
}

impl RecordingMode {
    /// Name reported to the collector in the options event
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingMode::Disabled => "disabled",
            RecordingMode::Recording => "session",
            RecordingMode::BufferingOnly => "buffer",
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collaborators the controller talks to
#[derive(Clone)]
pub struct ReplayDependencies {
    pub capture: Arc<dyn CaptureSource>,
    pub transport: Arc<dyn ReplayTransport>,
    pub store: Arc<dyn SessionStore>,
    pub clock: Arc<dyn Clock>,
}

impl ReplayDependencies {
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        transport: Arc<dyn ReplayTransport>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            capture,
            transport,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct ControllerState {
    mode: RecordingMode,
    /// Present exactly while `mode != Disabled`
    buffer: Option<EventBuffer>,
    sessions: SessionManager,
    scheduler: FlushScheduler,
    subscription: Option<Subscription>,
    /// Set while `stop()` runs; cancelled once teardown is done
    teardown: Option<CancellationToken>,
    renewing: bool,
    /// Bumped by an explicit `stop()` so an in-flight renewal gives up
    renewal_generation: u64,
}

impl ControllerState {
    fn session_label(&self) -> String {
        self.sessions
            .session()
            .map(|session| session.id.clone())
            .unwrap_or_else(|| "<none>".to_string())
    }

    fn segment_id(&self) -> u64 {
        self.sessions.session().map_or(0, |session| session.segment_id)
    }

    fn renewal_superseded(&self, renewal: Option<u64>) -> bool {
        renewal.is_some_and(|generation| generation != self.renewal_generation)
    }
}

struct PreparedSegment {
    payload: RecordingPayload,
    mark: BufferMark,
}

enum StopAction {
    Idle,
    Wait(CancellationToken),
    Teardown(Option<Subscription>, CancellationToken),
}

struct ControllerInner {
    config: ReplayConfig,
    capture: Arc<dyn CaptureSource>,
    transport: Arc<dyn ReplayTransport>,
    clock: Arc<dyn Clock>,
    state: Mutex<ControllerState>,
    /// Held for the whole duration of a flush
    flush_lock: tokio::sync::Mutex<()>,
}

/// Handle to a replay recorder. Cloning is cheap and every clone drives the
/// same recorder.
#[derive(Clone)]
pub struct ReplayController {
    inner: Arc<ControllerInner>,
}

impl ReplayController {
    pub fn new(config: ReplayConfig, deps: ReplayDependencies) -> ReplayResult<Self> {
        config.validate()?;

        let state = ControllerState {
            mode: RecordingMode::Disabled,
            buffer: None,
            sessions: SessionManager::new(deps.store, &config),
            scheduler: FlushScheduler::new(config.min_flush_delay(), config.max_flush_delay()),
            subscription: None,
            teardown: None,
            renewing: false,
            renewal_generation: 0,
        };

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                capture: deps.capture,
                transport: deps.transport,
                clock: deps.clock,
                state: Mutex::new(state),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Create a session, roll the sampling decision and start recording if
    /// the session was sampled. Returns whether recording started.
    pub fn initialize(&self) -> bool {
        let now = self.inner.clock.now_millis();
        let sampled = {
            let mut state = self.inner.state.lock();
            if state.mode != RecordingMode::Disabled {
                debug!("Replay already active in {} mode", state.mode);
                return false;
            }
            state.sessions.initialize_session_for_sampling(now).sampled
        };

        if !sampled {
            info!("Replay session was not sampled, recording stays disabled");
            return false;
        }
        self.inner.activate(RecordingMode::Recording, None);
        self.mode() == RecordingMode::Recording
    }

    /// Start recording and flushing. Promotes a buffering recorder.
    pub fn start(&self) {
        self.inner.activate(RecordingMode::Recording, None);
    }

    /// Capture into memory without flushing
    pub fn start_buffering(&self) {
        self.inner.activate(RecordingMode::BufferingOnly, None);
    }

    /// Detach from the capture source, send what is left and tear down the
    /// session. Resolves once teardown is complete.
    pub async fn stop(&self) {
        self.inner.cancel_renewal();
        self.inner.stop().await;
    }

    pub fn add_event(&self, event: CapturedEvent, is_checkout: bool) {
        self.inner.add_event(event, is_checkout);
    }

    /// Flush right away instead of waiting for the debounce timer
    pub async fn flush(&self) {
        self.inner.run_flush().await;
    }

    /// Page visibility changed. Hidden pages flush immediately.
    pub async fn handle_visibility_change(&self, visible: bool) {
        if visible {
            self.inner.to_foreground();
        } else {
            self.inner.to_background().await;
        }
    }

    pub async fn handle_window_blur(&self) {
        self.inner.to_background().await;
    }

    pub fn handle_window_focus(&self) {
        self.inner.to_foreground();
    }

    pub fn mode(&self) -> RecordingMode {
        self.inner.state.lock().mode
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.lock().sessions.session().cloned()
    }

    pub fn buffer_state(&self) -> Option<BufferState> {
        self.inner.state.lock().buffer.as_ref().map(EventBuffer::state)
    }

    pub fn has_pending_flush(&self) -> bool {
        self.inner.state.lock().scheduler.is_pending()
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.inner.config
    }
}

impl ControllerInner {
    /// `renewal` carries the generation of the renewal doing the restart
    fn activate(self: &Arc<Self>, target: RecordingMode, renewal: Option<u64>) {
        {
            let mut state = self.state.lock();
            if state.renewal_superseded(renewal) {
                debug!("Replay was stopped, dropping session renewal");
                return;
            }
            if state.teardown.is_some() {
                warn!("Replay is stopping, ignoring switch to {} mode", target);
                return;
            }
            match (state.mode, target) {
                (current, requested) if current == requested => {
                    debug!("Replay already in {} mode", requested);
                    return;
                }
                (RecordingMode::BufferingOnly, RecordingMode::Recording) => {
                    state.mode = RecordingMode::Recording;
                    info!(
                        "Replay {} promoted from buffering to recording",
                        state.session_label()
                    );
                    self.schedule_flush(&mut state);
                    return;
                }
                (RecordingMode::Recording, RecordingMode::BufferingOnly) => {
                    state.scheduler.cancel();
                    state.mode = RecordingMode::BufferingOnly;
                    info!("Replay {} switched to buffering", state.session_label());
                    return;
                }
                _ => {}
            }
        }

        // the capture source is called without holding the state lock
        let now = self.clock.now_millis();
        let checkout = self.capture.take_checkout(now);
        let subscription = self.capture.attach(self.event_callback());

        let mut guard = self.state.lock();
        if guard.mode != RecordingMode::Disabled
            || guard.teardown.is_some()
            || guard.renewal_superseded(renewal)
        {
            drop(guard);
            debug!("Replay state changed while starting, detaching extra listener");
            self.capture.detach(subscription);
            return;
        }

        let state = &mut *guard;
        let refresh = state.sessions.refresh(now);
        state.sessions.mark_sampled();
        let segment_id = state.segment_id();

        let mut buffer = EventBuffer::new(self.config.max_buffer_size_bytes);
        if segment_id == 0 {
            buffer.add(CapturedEvent::options(now, &self.config, target), false);
        }
        buffer.add(checkout, true);
        state.buffer = Some(buffer);
        state.mode = target;
        let stale = state.subscription.replace(subscription);

        info!(
            "Replay {} started in {} mode ({:?} session, segment {})",
            state.session_label(),
            target,
            refresh,
            segment_id
        );
        if target == RecordingMode::Recording {
            self.schedule_flush(state);
        }
        drop(guard);

        if let Some(stale) = stale {
            self.capture.detach(stale);
        }
    }

    fn event_callback(self: &Arc<Self>) -> EventCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event: CapturedEvent, is_checkout: bool| {
            if let Some(inner) = weak.upgrade() {
                inner.add_event(event, is_checkout);
            }
        })
    }

    fn add_event(self: &Arc<Self>, event: CapturedEvent, is_checkout: bool) {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.mode == RecordingMode::Disabled || state.teardown.is_some() {
            debug!(
                "Replay not active, ignoring {} event at {}",
                event.event_type, event.timestamp
            );
            return;
        }

        if state.sessions.is_expired(now) {
            debug!(
                "Replay session {} expired, dropping {} event",
                state.session_label(),
                event.event_type
            );
            self.schedule_renewal(state);
            return;
        }
        state.sessions.refresh(now);

        let mode = state.mode;
        let segment_id = state.segment_id();
        let Some(buffer) = state.buffer.as_mut() else {
            return;
        };

        // buffering keeps only the latest checkout window
        if mode == RecordingMode::BufferingOnly && is_checkout {
            buffer.clear();
            if segment_id == 0 {
                buffer.add(CapturedEvent::options(now, &self.config, mode), false);
            }
        }

        let outcome = buffer.add(event, is_checkout);
        if mode == RecordingMode::Recording && outcome == AddOutcome::Added {
            self.schedule_flush(state);
        }
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut ControllerState) {
        let weak = Arc::downgrade(self);
        state.scheduler.request_flush(move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.run_flush().await;
            }
        });
    }

    fn schedule_renewal(self: &Arc<Self>, state: &mut ControllerState) {
        if state.renewing {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, cannot renew expired replay session");
                return;
            }
        };

        state.renewing = true;
        let mode = state.mode;
        let generation = state.renewal_generation;
        let inner = self.clone();
        handle.spawn(async move {
            inner.renew_session(mode, generation).await;
        });
    }

    async fn renew_session(self: Arc<Self>, mode: RecordingMode, generation: u64) {
        info!("Renewing expired replay session in {} mode", mode);
        // only the renewal that tore the session down restarts it
        if self.stop().await {
            self.activate(mode, Some(generation));
        }
        let mut state = self.state.lock();
        if state.renewal_generation == generation {
            state.renewing = false;
        }
    }

    fn cancel_renewal(&self) {
        let mut state = self.state.lock();
        state.renewal_generation += 1;
        state.renewing = false;
    }

    async fn run_flush(&self) {
        let flush_guard = {
            let mut state = self.state.lock();
            state.scheduler.cancel();
            if state.mode != RecordingMode::Recording || state.teardown.is_some() {
                debug!("Replay not recording, skipping flush");
                return;
            }
            match self.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Flush already in progress, flushing again once it completes");
                    state.scheduler.mark_flush_again();
                    return;
                }
            }
        };

        loop {
            self.flush_segment().await;

            let mut state = self.state.lock();
            let again = state.scheduler.take_flush_again();
            if again && state.mode == RecordingMode::Recording && state.teardown.is_none() {
                continue;
            }
            // release while still holding the state lock so a concurrent
            // request either sees the flag consumed or gets the flush lock
            drop(flush_guard);
            return;
        }
    }

    fn prepare_segment(state: &ControllerState) -> Option<PreparedSegment> {
        let session = state.sessions.session()?;
        let buffer = state.buffer.as_ref()?;
        let mark = buffer.mark();
        if mark.is_empty() {
            return None;
        }
        debug!(
            "Preparing segment {} of replay {} with {} events",
            session.segment_id,
            session.id,
            mark.len()
        );

        let recording_data = match buffer.get_payload() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize replay segment: {}", e);
                return None;
            }
        };

        Some(PreparedSegment {
            payload: RecordingPayload {
                replay_id: session.id.clone(),
                recording_payload_header: SegmentHeader {
                    segment_id: session.segment_id,
                },
                recording_data,
            },
            mark,
        })
    }

    async fn flush_segment(&self) {
        let Some(segment) = Self::prepare_segment(&self.state.lock()) else {
            debug!("Replay buffer is empty, nothing to flush");
            return;
        };
        let payload = segment.payload;

        match self.transport.send(&payload).await {
            Ok(()) => {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let same_session = state
                    .sessions
                    .session()
                    .is_some_and(|session| session.id == payload.replay_id);
                if !same_session {
                    debug!("Replay session changed during flush, keeping buffer");
                    return;
                }
                let released = state
                    .buffer
                    .as_mut()
                    .map_or(0, |buffer| buffer.release(segment.mark));
                state.sessions.increment_segment();
                info!(
                    "Sent segment {} of replay {} ({} events) via {}",
                    payload.segment_id(),
                    payload.replay_id,
                    released,
                    self.transport.transport_name()
                );
            }
            Err(e) => {
                warn!(
                    "Failed to send segment {} of replay {}: {}",
                    payload.segment_id(),
                    payload.replay_id,
                    e
                );
            }
        }
    }

    /// Returns true when this call performed the teardown
    async fn stop(&self) -> bool {
        let action = {
            let mut state = self.state.lock();
            if let Some(teardown) = state.teardown.as_ref() {
                StopAction::Wait(teardown.clone())
            } else if state.mode == RecordingMode::Disabled {
                StopAction::Idle
            } else {
                let teardown = CancellationToken::new();
                state.teardown = Some(teardown.clone());
                state.scheduler.cancel();
                StopAction::Teardown(state.subscription.take(), teardown)
            }
        };

        let (subscription, teardown) = match action {
            StopAction::Idle => {
                debug!("Replay already stopped");
                return false;
            }
            StopAction::Wait(teardown) => {
                debug!("Replay stop already in progress, waiting for teardown");
                teardown.cancelled().await;
                return false;
            }
            StopAction::Teardown(subscription, teardown) => (subscription, teardown),
        };

        if let Some(subscription) = subscription {
            self.capture.detach(subscription);
        }

        // wait for the flush in flight, then keep others out until teardown
        let _flush_guard = self.flush_lock.lock().await;

        let final_segment = Self::prepare_segment(&self.state.lock());
        if let Some(segment) = final_segment {
            let payload = segment.payload;
            match self.transport.send(&payload).await {
                Ok(()) => info!(
                    "Sent final segment {} of replay {}",
                    payload.segment_id(),
                    payload.replay_id
                ),
                Err(e) => warn!(
                    "Final segment {} of replay {} was not delivered: {}",
                    payload.segment_id(),
                    payload.replay_id,
                    e
                ),
            }
        }

        {
            let mut state = self.state.lock();
            let session = state.session_label();
            state.scheduler.cancel();
            state.scheduler.take_flush_again();
            state.buffer = None;
            state.mode = RecordingMode::Disabled;
            state.sessions.clear_session();
            state.teardown = None;
            info!("Replay {} stopped", session);
        }
        teardown.cancel();
        true
    }

    async fn to_background(&self) {
        let now = self.clock.now_millis();
        let should_flush = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.mode == RecordingMode::Disabled || state.teardown.is_some() {
                return;
            }
            if state.sessions.is_expired(now) {
                debug!("Replay session expired while hidden, nothing to record");
                return;
            }
            if let Some(buffer) = state.buffer.as_mut() {
                buffer.add(CapturedEvent::breadcrumb(now, "ui.blur"), false);
            }
            state.mode == RecordingMode::Recording
        };

        if should_flush {
            self.run_flush().await;
        }
    }

    fn to_foreground(self: &Arc<Self>) {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.mode == RecordingMode::Disabled || state.teardown.is_some() {
            return;
        }
        if state.sessions.is_expired(now) {
            self.schedule_renewal(state);
            return;
        }

        let mode = state.mode;
        let Some(buffer) = state.buffer.as_mut() else {
            return;
        };
        let outcome = buffer.add(CapturedEvent::breadcrumb(now, "ui.focus"), false);
        if mode == RecordingMode::Recording && outcome == AddOutcome::Added {
            self.schedule_flush(state);
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.state.get_mut().subscription.take() {
            self.capture.detach(subscription);
        }
    }
}
