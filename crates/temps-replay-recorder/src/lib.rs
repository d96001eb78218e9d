//! temps-replay-recorder: client-side session replay recorder
//!
//! Collects captured interaction events into size-bounded segments, flushes
//! them to the Temps session replay collector on a debounced schedule and
//! manages the recording session (sampling, activity, expiry, stop/resume).
//!
//! The host wires a [`CaptureSource`], a [`ReplayTransport`] and a
//! [`SessionStore`] into a [`ReplayController`] and drives it with
//! `start`, `start_buffering` and `stop`.

pub mod buffer;
pub mod capture;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod transport;

pub use buffer::{AddOutcome, BufferMark, BufferState, EventBuffer};
pub use capture::{CaptureSource, EventCallback, ManualCaptureSource, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReplayConfig;
pub use controller::{RecordingMode, ReplayController, ReplayDependencies};
pub use error::{ReplayError, ReplayResult, TransportError};
pub use event::{CapturedEvent, EventType};
pub use scheduler::FlushScheduler;
pub use session::{Session, SessionManager, SessionRefresh};
pub use storage::{FileSessionStore, MemorySessionStore, SessionStore};
pub use transport::{
    encode_events, ClientMetadata, HttpTransport, RecordingPayload, ReplayTransport,
    SegmentHeader, VISITOR_COOKIE,
};
