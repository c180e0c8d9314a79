//! Snapshot and projection checkpoint ports

use std::future::Future;

use chrono::{DateTime, Utc};
use cv_domain::{ErrorKind, MediatorError, SnapshotRecord};
use serde::{Deserialize, Serialize};

/// Snapshot store errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    #[error("snapshot version {snapshot} exceeds stream version {stream}")]
    VersionAheadOfStream { snapshot: u64, stream: u64 },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl From<SnapshotStoreError> for MediatorError {
    fn from(e: SnapshotStoreError) -> Self {
        let kind = match &e {
            SnapshotStoreError::VersionAheadOfStream { .. } => ErrorKind::Validation,
            SnapshotStoreError::StorageUnavailable { .. } => ErrorKind::Transient,
            SnapshotStoreError::SerializationError { .. } => ErrorKind::Fatal,
        };
        MediatorError::new(kind, e.to_string())
    }
}

/// Point-in-time aggregate snapshots with retained history.
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot. Idempotent per `(stream_id, version)`: saving the
    /// same pair twice leaves a single retained snapshot at that version.
    fn save(
        &self,
        snapshot: SnapshotRecord,
    ) -> impl Future<Output = Result<(), SnapshotStoreError>> + Send;

    /// Highest-version snapshot for a stream, if any.
    fn get(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Option<SnapshotRecord>, SnapshotStoreError>> + Send;

    /// All retained snapshots for a stream in ascending version order.
    fn history(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Vec<SnapshotRecord>, SnapshotStoreError>> + Send;

    /// Prune snapshots strictly below `version`. Returns the pruned count.
    fn delete_older_than(
        &self,
        stream_id: &str,
        version: u64,
    ) -> impl Future<Output = Result<usize, SnapshotStoreError>> + Send;
}

/// Durable cursor of a projection or subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub stream_pattern: String,
    /// Last processed store-wide sequence.
    pub position: u64,
    pub processed_count: u64,
    pub last_processed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn initial(name: impl Into<String>, stream_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_pattern: stream_pattern.into(),
            position: 0,
            processed_count: 0,
            last_processed_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Checkpoint store errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointStoreError {
    #[error("checkpoint position went backwards: stored {stored}, offered {offered}")]
    PositionRegression { stored: u64, offered: u64 },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },
}

/// Keyed checkpoint storage; positions advance monotonically.
pub trait CheckpointStore: Send + Sync {
    fn get(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Checkpoint>, CheckpointStoreError>> + Send;

    /// Store a checkpoint. Rejects positions behind the stored one; a
    /// rebuild goes through `reset` instead.
    fn put(
        &self,
        checkpoint: Checkpoint,
    ) -> impl Future<Output = Result<(), CheckpointStoreError>> + Send;

    /// Drop a checkpoint so the projection replays from the beginning.
    fn reset(&self, name: &str) -> impl Future<Output = Result<(), CheckpointStoreError>> + Send;
}
