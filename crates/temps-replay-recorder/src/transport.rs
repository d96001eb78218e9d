//! Segment transport
//!
//! The controller hands every finished segment to a [`ReplayTransport`].
//! [`HttpTransport`] talks to the Temps session replay collector.

use async_trait::async_trait;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{ReplayError, ReplayResult, TransportError};

/// Cookie the collector uses to attribute replays to a visitor
pub const VISITOR_COOKIE: &str = "_temps_visitor_id";

const INIT_PATH: &str = "/_temps/session-replay/init";
const EVENTS_PATH: &str = "/_temps/session-replay/events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub segment_id: u64,
}

/// One flushed segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingPayload {
    pub replay_id: String,
    pub recording_payload_header: SegmentHeader,
    /// JSON array of the segment's events, in capture order
    pub recording_data: String,
}

impl RecordingPayload {
    pub fn segment_id(&self) -> u64 {
        self.recording_payload_header.segment_id
    }
}

#[async_trait]
pub trait ReplayTransport: Send + Sync {
    /// Deliver a segment. Errors are reported, never retried by the caller.
    async fn send(&self, payload: &RecordingPayload) -> Result<(), TransportError>;

    fn transport_name(&self) -> &'static str;
}

/// Environment details sent with the first segment of a replay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest<'a> {
    session_id: &'a str,
    #[serde(flatten)]
    metadata: &'a ClientMetadata,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsRequest<'a> {
    session_id: &'a str,
    events: String,
}

/// Compress and base64 encode a serialized event array the way the collector
/// expects it (zlib, standard alphabet)
pub fn encode_events(recording_data: &str) -> Result<String, TransportError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(recording_data.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Transport for the Temps collector API
pub struct HttpTransport {
    base_url: String,
    api_key: Option<String>,
    visitor_id: Option<String>,
    metadata: ClientMetadata,
    client: Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> ReplayResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> ReplayResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            error!("Failed to create HTTP client: {}", e);
            ReplayError::Transport(TransportError::Http(format!(
                "Failed to create HTTP client: {}",
                e
            )))
        })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            visitor_id: None,
            metadata: ClientMetadata::default(),
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_visitor_id(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = Some(visitor_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ClientMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);

        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        if let Some(ref visitor_id) = self.visitor_id {
            request = request.header("Cookie", format!("{}={}", VISITOR_COOKIE, visitor_id));
        }

        let response = request.send().await.map_err(|e| {
            error!("Request to {} failed: {}", url, e);
            TransportError::from(e)
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("Collector returned error {} for {}: {}", status, path, body);
            return Err(TransportError::Rejected { status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl ReplayTransport for HttpTransport {
    async fn send(&self, payload: &RecordingPayload) -> Result<(), TransportError> {
        if payload.segment_id() == 0 {
            let init = InitRequest {
                session_id: &payload.replay_id,
                metadata: &self.metadata,
                timestamp: chrono::Utc::now().to_rfc3339(),
            };
            self.post(INIT_PATH, &init).await?;
            info!("Registered replay {} with collector", payload.replay_id);
        }

        let events = EventsRequest {
            session_id: &payload.replay_id,
            events: encode_events(&payload.recording_data)?,
        };
        debug!(
            "Sending segment {} of replay {} ({} bytes encoded)",
            payload.segment_id(),
            payload.replay_id,
            events.events.len()
        );
        self.post(EVENTS_PATH, &events).await
    }

    fn transport_name(&self) -> &'static str {
        "http"
    }
}
