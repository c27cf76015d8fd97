//! Wire frames pushed by the security event stream.
//!
//! Every frame is a JSON object `{ "type", "data", "timestamp" }`. Decoding
//! is two-step so that undecodable text and well-formed frames of an
//! unknown `type` can be told apart by the caller.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Raw frame envelope as sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Server acknowledged the subscription.
    Connected,
    /// One domain event.
    Event(StreamEvent),
    /// Liveness proof carrying the server timestamp in epoch milliseconds.
    Heartbeat { timestamp: i64 },
    /// Aggregate payload, last value wins.
    Stats(Value),
    /// Server-reported error description.
    Error { message: String },
}

/// Reasons a frame was dropped instead of classified.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Text was not a JSON frame envelope.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Envelope decoded but carried a `type` this client does not handle.
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
}

impl StreamMessage {
    /// Decodes and classifies one frame.
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        let frame: WireFrame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    /// Classifies an already decoded envelope.
    pub fn from_frame(frame: WireFrame) -> Result<Self, FrameError> {
        let WireFrame {
            kind,
            data,
            timestamp,
        } = frame;

        match kind.as_str() {
            "connected" => Ok(Self::Connected),
            "event" => Ok(Self::Event(StreamEvent {
                payload: data,
                timestamp,
            })),
            "heartbeat" => {
                let timestamp = timestamp
                    .or_else(|| data.get("timestamp").and_then(Value::as_i64))
                    .unwrap_or_else(now_ms);
                Ok(Self::Heartbeat { timestamp })
            }
            "stats" => Ok(Self::Stats(data)),
            "error" => Ok(Self::Error {
                message: error_text(&data),
            }),
            _ => Err(FrameError::UnknownType(kind)),
        }
    }
}

fn error_text(data: &Value) -> String {
    data.get("error")
        .and_then(Value::as_str)
        .or_else(|| data.get("message").and_then(Value::as_str))
        .or_else(|| data.as_str())
        .unwrap_or("server reported an error")
        .to_string()
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A domain event forwarded verbatim from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// The `data` field of the frame, untouched.
    pub payload: Value,
    /// Frame timestamp in epoch milliseconds, when present.
    pub timestamp: Option<i64>,
}

impl StreamEvent {
    /// Reads the `severity` field of the payload, when it is a known level.
    pub fn severity(&self) -> Option<Severity> {
        self.payload
            .get("severity")
            .and_then(Value::as_str)
            .and_then(Severity::parse)
    }

    /// Decodes the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Security event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Case-insensitive parse of a severity level.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// True when `self` is at least as severe as `threshold`.
    ///
    /// Used by consumers deciding whether an event warrants a platform
    /// notification.
    pub fn meets(self, threshold: Severity) -> bool {
        self >= threshold
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection rule that produced a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRule {
    Egress,
    BruteForce,
    Sudo,
    OomKill,
    #[serde(other)]
    Other,
}

/// Owning VM summary embedded in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, rename = "hostId", skip_serializing_if = "Option::is_none")]
    pub host_id: Option<u64>,
}

/// Typed view of the security event payload pushed in `event` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: u64,
    pub vm_id: u64,
    /// ISO-8601 time the event was observed in the VM log.
    pub timestamp: String,
    /// Log source, eg `auth.log`, `kern.log`, `syslog`.
    pub source: String,
    pub message: String,
    pub severity: Severity,
    pub rule: SecurityRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_at: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmSummary>,
}

/// Typed view of the aggregate payload pushed in `stats` frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityEventStats {
    pub total: u64,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    #[serde(rename = "last24h")]
    pub last_24h: u64,
    pub acknowledged: u64,
    pub unacknowledged: u64,
}
