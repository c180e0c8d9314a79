//! Point-in-time aggregate snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A snapshot of aggregate state at a specific stream version.
///
/// Invariant: `version` never exceeds the version of the underlying stream
/// at the time the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub stream_id: String,
    pub version: u64,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn new(
        stream_id: impl Into<String>,
        version: u64,
        state: serde_json::Value,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            state,
            taken_at,
        }
    }

    /// Capture a typed state value.
    pub fn of<S: Serialize>(
        stream_id: impl Into<String>,
        version: u64,
        state: &S,
        taken_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            stream_id,
            version,
            serde_json::to_value(state)?,
            taken_at,
        ))
    }

    pub fn state_as<S: serde::de::DeserializeOwned>(&self) -> Result<S, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }
}
