//! In-memory snapshot store

use std::collections::{BTreeMap, HashMap};

use cv_domain::SnapshotRecord;
use cv_ports::{SnapshotStore, SnapshotStoreError};
use tokio::sync::RwLock;

/// In-memory snapshot store retaining full per-stream history.
#[derive(Default)]
pub struct MemorySnapshotStore {
    // stream id -> version -> snapshot
    snapshots: RwLock<HashMap<String, BTreeMap<u64, SnapshotRecord>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: SnapshotRecord) -> Result<(), SnapshotStoreError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(snapshot.stream_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot);
        Ok(())
    }

    async fn get(&self, stream_id: &str) -> Result<Option<SnapshotRecord>, SnapshotStoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(stream_id)
            .and_then(|history| history.last_key_value())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn history(&self, stream_id: &str) -> Result<Vec<SnapshotRecord>, SnapshotStoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(stream_id)
            .map(|history| history.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_older_than(
        &self,
        stream_id: &str,
        version: u64,
    ) -> Result<usize, SnapshotStoreError> {
        let mut snapshots = self.snapshots.write().await;
        let Some(history) = snapshots.get_mut(stream_id) else {
            return Ok(0);
        };
        let retained = history.split_off(&version);
        let pruned = history.len();
        *history = retained;
        Ok(pruned)
    }
}
