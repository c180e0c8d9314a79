//! Reliability ports: outbox, inbox, dead letters, idempotency

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cv_domain::{DeadLetter, ErrorKind, MediatorError, MessageId, OutboxMessage};

/// Outbox store errors
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox message not found: {id}")]
    MessageNotFound { id: String },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl From<OutboxError> for MediatorError {
    fn from(e: OutboxError) -> Self {
        let kind = match &e {
            OutboxError::MessageNotFound { .. } => ErrorKind::NotFound,
            OutboxError::StorageUnavailable { .. } => ErrorKind::Transient,
            OutboxError::SerializationError { .. } => ErrorKind::Fatal,
        };
        MediatorError::new(kind, e.to_string())
    }
}

/// Staging table for at-least-once external dispatch.
///
/// `add` runs inside the same unit of work as the event append; the caller
/// owns that ordering. A separate processor drains `pending` and marks rows.
pub trait OutboxStore: Send + Sync {
    fn add(&self, message: OutboxMessage) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// Up to `limit` unprocessed messages, FIFO by `created_at`.
    fn pending(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send;

    /// Flag a message as dispatched. Idempotent: marking an already
    /// processed or unknown id is a no-op.
    fn mark_processed(&self, id: &str) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// Record a dispatch attempt and return the new attempt count.
    fn record_attempt(&self, id: &str) -> impl Future<Output = Result<u32, OutboxError>> + Send;

    /// Delete processed rows older than the cutoff. Returns the count.
    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, OutboxError>> + Send;
}

/// Inbox store errors
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },
}

impl From<InboxError> for MediatorError {
    fn from(e: InboxError) -> Self {
        MediatorError::transient(e.to_string())
    }
}

/// Duplicate-delivery guard for inbound messages.
pub trait InboxStore: Send + Sync {
    /// Atomically record a message id. Returns `true` only on the first
    /// insertion of that id within its ttl; an expired marker counts as
    /// absent.
    fn try_store(
        &self,
        message_id: MessageId,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, InboxError>> + Send;

    /// Drop expired markers. Returns the purged count.
    fn purge_expired(&self) -> impl Future<Output = Result<usize, InboxError>> + Send;
}

/// Dead letter store errors
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter not found: {origin_queue}/{message_id}")]
    NotFound {
        origin_queue: String,
        message_id: String,
    },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },
}

impl From<DeadLetterError> for MediatorError {
    fn from(e: DeadLetterError) -> Self {
        let kind = match &e {
            DeadLetterError::NotFound { .. } => ErrorKind::NotFound,
            DeadLetterError::StorageUnavailable { .. } => ErrorKind::Transient,
        };
        MediatorError::new(kind, e.to_string())
    }
}

/// Storage for terminally failed messages, keyed by `(origin_queue, message_id)`.
pub trait DeadLetterStore: Send + Sync {
    /// Store a dead letter. A second add for the same key replaces the entry
    /// and keeps the higher retry count.
    fn add(&self, letter: DeadLetter) -> impl Future<Output = Result<(), DeadLetterError>> + Send;

    /// Page through a queue's dead letters, oldest first.
    fn list(
        &self,
        origin_queue: &str,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send;

    fn remove(
        &self,
        origin_queue: &str,
        message_id: &str,
    ) -> impl Future<Output = Result<(), DeadLetterError>> + Send;

    /// Flag a letter as beyond replay.
    fn mark_permanent(
        &self,
        origin_queue: &str,
        message_id: &str,
    ) -> impl Future<Output = Result<(), DeadLetterError>> + Send;
}

/// Idempotency store errors
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl From<IdempotencyError> for MediatorError {
    fn from(e: IdempotencyError) -> Self {
        let kind = match &e {
            IdempotencyError::StorageUnavailable { .. } => ErrorKind::Transient,
            IdempotencyError::SerializationError { .. } => ErrorKind::Fatal,
        };
        MediatorError::new(kind, e.to_string())
    }
}

/// Request-level result cache for exactly-once-effect handlers.
///
/// The ttl is advisory for in-memory backends; persistent ones honour it.
pub trait IdempotencyStore: Send + Sync {
    fn store(
        &self,
        request_id: &str,
        result: serde_json::Value,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), IdempotencyError>> + Send;

    fn is_processed(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<bool, IdempotencyError>> + Send;

    fn get(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, IdempotencyError>> + Send;
}
