//! Reliability records: outbox, inbox, and dead letters

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::message::MessageId;

/// A message staged for external dispatch, co-committed with the state change
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// `obx_<ULID>`.
    pub id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    /// Source stream, carried so a partitioned processor can preserve
    /// per-stream order.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl OutboxMessage {
    pub fn new(
        message_type: impl Into<String>,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("obx_{}", Ulid::new()),
            message_type: message_type.into(),
            payload,
            stream_id: None,
            created_at,
            processed_at: None,
            attempts: 0,
        }
    }

    pub fn for_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Marker recording that an inbound message id has been seen.
///
/// A handler that finds an existing, unexpired marker rejects the delivery
/// as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub message_id: MessageId,
    pub expires_at: DateTime<Utc>,
}

impl InboxRecord {
    pub fn new(message_id: MessageId, expires_at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A terminally failed message parked for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub origin_queue: String,
    pub payload: Vec<u8>,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub retry_count: u32,
    /// Set when no amount of replaying can succeed, e.g. a poison payload.
    pub permanent: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl DeadLetter {
    pub fn new(
        message_id: impl Into<String>,
        origin_queue: impl Into<String>,
        payload: Vec<u8>,
        reason: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            origin_queue: origin_queue.into(),
            payload,
            failed_at,
            reason: reason.into(),
            retry_count: 0,
            permanent: false,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}
