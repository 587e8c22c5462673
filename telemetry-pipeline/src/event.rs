use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use common_kafka::{Headers, OutboundRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_EVENT_SEVERITY: &str = "event-severity";
pub const HEADER_EVENT_SOURCE: &str = "event-source";

/// A security telemetry record. Anything beyond the well-known fields is kept
/// verbatim in `fields` and round-trips through the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(id: &str, event_type: &str, severity: &str, source: &str) -> Self {
        Self {
            id: id.to_owned(),
            event_type: event_type.to_owned(),
            severity: severity.to_owned(),
            source: source.to_owned(),
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Parsed severity, `None` when the emitter used a label we do not rank.
    pub fn severity_level(&self) -> Option<Severity> {
        self.severity.parse().ok()
    }

    /// Content hash over the fields that identify an occurrence: id, type,
    /// source and timestamp. Extra fields do not participate.
    pub fn dedup_key(&self) -> String {
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let mut hasher = Sha256::new();
        for part in [
            self.id.as_str(),
            self.event_type.as_str(),
            self.source.as_str(),
            timestamp.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown severity: {0}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(UnknownSeverity(s.to_owned())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Transport wrapper for one event on its way to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// Milliseconds since epoch, taken from the event
    pub timestamp: i64,
    pub headers: Headers,
}

impl Envelope {
    /// Serializes `event` for `channel`. The partition key defaults to the event id.
    pub fn wrap(channel: &str, event: &Event, key: Option<&str>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: channel.to_owned(),
            key: key.unwrap_or(&event.id).to_owned(),
            payload: serde_json::to_vec(event)?,
            timestamp: event.timestamp.timestamp_millis(),
            headers: vec![
                (HEADER_EVENT_TYPE.to_string(), event.event_type.clone()),
                (HEADER_EVENT_SEVERITY.to_string(), event.severity.clone()),
                (HEADER_EVENT_SOURCE.to_string(), event.source.clone()),
            ],
        })
    }

    pub fn to_record(&self) -> OutboundRecord {
        OutboundRecord {
            key: Some(self.key.clone()),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            timestamp: Some(self.timestamp),
        }
    }
}
