//! Captured event model
//!
//! Events use the rrweb envelope the Temps collector stores:
//! `{"type": <u8>, "timestamp": <ms>, "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::config::ReplayConfig;
use crate::controller::RecordingMode;

/// rrweb event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventType {
    DomContentLoaded,
    Load,
    /// Full snapshot of the monitored surface
    Checkout,
    /// Delta relative to the latest checkout
    Incremental,
    Meta,
    Custom,
    Plugin,
}

impl From<EventType> for u8 {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::DomContentLoaded => 0,
            EventType::Load => 1,
            EventType::Checkout => 2,
            EventType::Incremental => 3,
            EventType::Meta => 4,
            EventType::Custom => 5,
            EventType::Plugin => 6,
        }
    }
}

impl TryFrom<u8> for EventType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventType::DomContentLoaded),
            1 => Ok(EventType::Load),
            2 => Ok(EventType::Checkout),
            3 => Ok(EventType::Incremental),
            4 => Ok(EventType::Meta),
            5 => Ok(EventType::Custom),
            6 => Ok(EventType::Plugin),
            other => Err(format!("Unknown event type: {}", other)),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::DomContentLoaded => write!(f, "DomContentLoaded"),
            EventType::Load => write!(f, "Load"),
            EventType::Checkout => write!(f, "Checkout"),
            EventType::Incremental => write!(f, "Incremental"),
            EventType::Meta => write!(f, "Meta"),
            EventType::Custom => write!(f, "Custom"),
            EventType::Plugin => write!(f, "Plugin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: i64,
    pub data: Value,
}

impl CapturedEvent {
    pub fn new(event_type: EventType, timestamp: i64, data: Value) -> Self {
        Self {
            event_type,
            timestamp,
            data,
        }
    }

    pub fn checkout(timestamp: i64, data: Value) -> Self {
        Self::new(EventType::Checkout, timestamp, data)
    }

    pub fn incremental(timestamp: i64, data: Value) -> Self {
        Self::new(EventType::Incremental, timestamp, data)
    }

    /// Custom events carry a `tag` and an arbitrary `payload`
    pub fn custom(timestamp: i64, tag: &str, payload: Value) -> Self {
        Self::new(
            EventType::Custom,
            timestamp,
            json!({ "tag": tag, "payload": payload }),
        )
    }

    /// Synthetic event describing the recorder settings in effect for the
    /// session. Replayers read it from the first segment.
    pub fn options(timestamp: i64, config: &ReplayConfig, mode: RecordingMode) -> Self {
        Self::custom(
            timestamp,
            "options",
            json!({
                "recordingMode": mode.as_str(),
                "sessionSampleRate": config.session_sample_rate,
                "maxBufferSizeBytes": config.max_buffer_size_bytes,
                "minFlushDelay": config.min_flush_delay_ms,
                "maxFlushDelay": config.max_flush_delay_ms,
                "sessionInactivityThreshold": config.session_inactivity_threshold_ms,
                "maxSessionDuration": config.max_session_duration_ms,
            }),
        )
    }

    /// Breadcrumb annotation such as `ui.blur` / `ui.focus`
    pub fn breadcrumb(timestamp: i64, category: &str) -> Self {
        Self::custom(
            timestamp,
            "breadcrumb",
            json!({
                "type": "default",
                "category": category,
                "timestamp": timestamp as f64 / 1000.0,
            }),
        )
    }

    pub fn is_checkout(&self) -> bool {
        self.event_type == EventType::Checkout
    }

    /// Custom event tag, if any
    pub fn tag(&self) -> Option<&str> {
        if self.event_type != EventType::Custom {
            return None;
        }
        self.data.get("tag").and_then(Value::as_str)
    }

    /// Serialized JSON length, used for the buffer size bound
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or_default()
    }
}
