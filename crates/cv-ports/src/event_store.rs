//! Event store port
//!
//! The append-only event log is the sole source of truth for aggregate
//! state. Appends to one stream are linearizable; distinct streams may
//! proceed in parallel.

use std::future::Future;

use cv_domain::{ErrorKind, EventData, EventEnvelope, EventStream, MediatorError};
use tokio::sync::broadcast;

/// Concurrency expectation for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No concurrency check.
    Any,
    /// Append succeeds only if the stream is currently at this version.
    /// `Exact(0)` means the stream must not exist yet.
    Exact(u64),
}

/// Event store errors
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("concurrency conflict: expected version {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("invalid stream id: {reason}")]
    InvalidStreamId { reason: String },

    #[error("invalid stream pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("storage corruption: {message}")]
    StorageCorruption { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl From<EventStoreError> for MediatorError {
    fn from(e: EventStoreError) -> Self {
        let kind = match &e {
            EventStoreError::ConcurrencyConflict { .. } => ErrorKind::Conflict,
            EventStoreError::InvalidStreamId { .. } | EventStoreError::InvalidPattern { .. } => {
                ErrorKind::Validation
            }
            EventStoreError::StorageUnavailable { .. } => ErrorKind::Transient,
            EventStoreError::StorageCorruption { .. }
            | EventStoreError::SerializationError { .. } => ErrorKind::Fatal,
        };
        MediatorError::new(kind, e.to_string())
    }
}

/// Append-only per-stream event log with optimistic concurrency.
pub trait EventStore: Send + Sync {
    /// Append events atomically and return the new stream version.
    ///
    /// Either every event appears with contiguous versions or none do.
    fn append(
        &self,
        stream_id: &str,
        events: Vec<EventData>,
        expected_version: ExpectedVersion,
    ) -> impl Future<Output = Result<u64, EventStoreError>> + Send;

    /// Read a slice of a stream's history in version order.
    ///
    /// Returns an empty stream (version 0) for an absent stream; a missing
    /// stream is never an error here.
    fn read(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: usize,
    ) -> impl Future<Output = Result<EventStream, EventStoreError>> + Send;

    fn stream_exists(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<bool, EventStoreError>> + Send;

    /// Current version of a stream, 0 if absent.
    fn stream_version(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<u64, EventStoreError>> + Send;

    /// Remove a stream and its events. Subsequent reads see an empty stream.
    fn delete_stream(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<(), EventStoreError>> + Send;

    /// Stream ids matching a `*` wildcard pattern.
    fn list_streams(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<String>, EventStoreError>> + Send;

    /// Replay events across all streams in store-wide append order.
    ///
    /// Feeds projection rebuild and catch-up; `from_global_seq` is exclusive.
    fn replay_all(
        &self,
        from_global_seq: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send;
}

/// Reject stream ids the log cannot address.
pub fn validate_stream_id(stream_id: &str) -> Result<(), EventStoreError> {
    if stream_id.is_empty() {
        return Err(EventStoreError::InvalidStreamId {
            reason: "stream id must be non-empty".to_string(),
        });
    }
    Ok(())
}

/// Error surfaced by a live subscription feed.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The store dropped its feed; no more events will arrive.
    #[error("subscription closed")]
    Closed,

    /// The subscriber fell behind and missed `0` events. Callers recover by
    /// catching up through `EventStore::replay_all`.
    #[error("subscription lagged, missed {0} events")]
    Lagged(u64),
}

/// Live feed of envelopes in store-wide append order.
pub struct EventSubscription {
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventSubscription {
    pub fn new(receiver: broadcast::Receiver<EventEnvelope>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Result<EventEnvelope, SubscriptionError> {
        match self.receiver.recv().await {
            Ok(envelope) => Ok(envelope),
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
        }
    }
}

/// Source of live append notifications.
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to every append from this point on.
    fn subscribe_all(&self) -> EventSubscription;
}
