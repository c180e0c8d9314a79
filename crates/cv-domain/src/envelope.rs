//! Event envelopes and streams

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Event identifier: `evt_<ULID>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn new() -> Self {
        Self(format!("evt_{}", Ulid::new()))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event as handed to the store for appending.
///
/// Versions and identities are assigned by the store at append time; callers
/// supply only the type tag, the payload, and optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EventData {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Serialize a typed event into an `EventData` with its domain name.
    pub fn encode<E: Serialize>(
        event_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(event)?))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An event as persisted in a stream. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub stream_id: String,
    /// 1-based, contiguous position within the stream.
    pub version: u64,
    /// Position in the store-wide append order, assigned at append time.
    /// Streams have no order relative to each other; this only sequences the
    /// projection and subscription feeds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub global_seq: Option<u64>,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// `sha256:`-prefixed digest over the identity fields.
    pub envelope_hash: String,
}

impl EventEnvelope {
    /// Seal an `EventData` into its persisted form.
    pub fn seal(
        stream_id: impl Into<String>,
        version: u64,
        data: EventData,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let stream_id = stream_id.into();
        let event_id = EventId::new();
        let envelope_hash = compute_envelope_hash(&event_id, &stream_id, version);
        Self {
            event_id,
            stream_id,
            version,
            global_seq: None,
            event_type: data.event_type,
            occurred_at,
            payload: data.payload,
            metadata: data.metadata,
            envelope_hash,
        }
    }

    /// Deserialize the payload into a typed event.
    pub fn payload_as<E: serde::de::DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Digest binding an envelope to its position, used for duplicate detection
/// on dispatch paths.
pub fn compute_envelope_hash(event_id: &EventId, stream_id: &str, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_str().as_bytes());
    hasher.update(stream_id.as_bytes());
    hasher.update(version.to_le_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// An ordered slice of a stream's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStream {
    pub stream_id: String,
    /// Current version of the stream at read time (0 for an absent stream).
    pub version: u64,
    pub events: Vec<EventEnvelope>,
}

impl EventStream {
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            version: 0,
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check that returned versions are contiguous, starting at `from_version`.
    pub fn verify_contiguous(&self, from_version: u64) -> bool {
        self.events
            .iter()
            .enumerate()
            .all(|(i, e)| e.version == from_version + i as u64)
    }
}
