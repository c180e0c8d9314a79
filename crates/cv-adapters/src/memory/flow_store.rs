//! In-memory flow snapshot store

use std::collections::HashMap;

use cv_domain::FlowSnapshot;
use cv_ports::{FlowStore, FlowStoreError};
use tokio::sync::RwLock;

/// In-memory flow snapshots keyed by flow id.
///
/// Each `save` replaces the whole snapshot atomically; the engine is the
/// single writer per flow id.
#[derive(Default)]
pub struct MemoryFlowStore {
    flows: RwLock<HashMap<String, FlowSnapshot>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryFlowStore {
    async fn save(&self, snapshot: FlowSnapshot) -> Result<(), FlowStoreError> {
        self.flows
            .write()
            .await
            .insert(snapshot.flow_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, FlowStoreError> {
        Ok(self.flows.read().await.get(flow_id).cloned())
    }

    async fn delete(&self, flow_id: &str) -> Result<(), FlowStoreError> {
        self.flows.write().await.remove(flow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cv_domain::FlowStatus;
    use serde_json::json;

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let store = MemoryFlowStore::new();
        let mut snapshot = FlowSnapshot::initial("flow_1", json!({"n": 0}), Utc::now());
        store.save(snapshot.clone()).await.unwrap();

        snapshot.status = FlowStatus::Failed;
        snapshot.attempts = 2;
        store.save(snapshot).await.unwrap();

        let loaded = store.load("flow_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, FlowStatus::Failed);
        assert_eq!(loaded.attempts, 2);
        assert!(store.load("missing").await.unwrap().is_none());
    }
}
