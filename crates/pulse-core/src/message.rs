//! Relay payload schema: what a reassembled message means.
//!
//! A completed message is one schema-version byte followed by the JSON
//! encoding of [`RelayMessage`]. Receivers drop payloads whose version they
//! do not understand instead of guessing at their layout.

use serde::{Deserialize, Serialize};

/// Current payload schema version.
pub const PAYLOAD_VERSION: u8 = 0x01;

/// What kind of answer an offline device is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Free-form question for the AI assistant.
    Assistant,
    /// Emergency dispatch request.
    Sos,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Assistant => "assistant",
            QueryKind::Sos => "sos",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// The application-level messages carried by the transport.
///
/// Queries and responses are correlated only by `query_id`; reports and
/// their acknowledgements only by `report_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum RelayMessage {
    Query {
        query_id: String,
        text: String,
        kind: QueryKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
        origin_device: String,
        /// SOS details, forwarded to the backend verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<serde_json::Value>,
    },
    Response {
        query_id: String,
        text: String,
    },
    /// Incident report written by an offline device for the backend store.
    Report {
        report_id: String,
        report_type: String,
        title: String,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<u8>,
        origin_device: String,
    },
    ReportAck {
        report_id: String,
    },
    /// Presence heartbeat.
    Presence {
        device: String,
    },
}

impl RelayMessage {
    /// Serialize to the versioned payload carried by the codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        let mut out = vec![PAYLOAD_VERSION];
        serde_json::to_writer(&mut out, self).map_err(PayloadError::Encode)?;
        Ok(out)
    }

    /// Parse a reassembled payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PayloadError> {
        let (&version, body) = data.split_first().ok_or(PayloadError::Empty)?;
        if version != PAYLOAD_VERSION {
            return Err(PayloadError::UnknownVersion(version));
        }
        serde_json::from_slice(body).map_err(PayloadError::Decode)
    }

    /// Short label for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RelayMessage::Query { .. } => "query",
            RelayMessage::Response { .. } => "response",
            RelayMessage::Report { .. } => "report",
            RelayMessage::ReportAck { .. } => "report_ack",
            RelayMessage::Presence { .. } => "presence",
        }
    }
}

/// Derive a query or report id: the first 16 hex chars of
/// `blake3(device || timestamp_le || text)`.
pub fn derive_id(device: &str, timestamp_ms: u64, text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(device.as_bytes());
    hasher.update(&timestamp_ms.to_le_bytes());
    hasher.update(text.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash.as_bytes()[..8])
}

/// Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("unknown payload version: 0x{0:02x}")]
    UnknownVersion(u8),
    #[error("failed to encode payload: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(serde_json::Error),
}
