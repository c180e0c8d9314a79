//! In-memory projection checkpoint store

use std::collections::HashMap;

use cv_ports::{Checkpoint, CheckpointStore, CheckpointStoreError};
use tokio::sync::RwLock;

/// In-memory checkpoint rows keyed by projection name.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        Ok(self.checkpoints.read().await.get(name).cloned())
    }

    async fn put(&self, checkpoint: Checkpoint) -> Result<(), CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        if let Some(stored) = checkpoints.get(&checkpoint.name) {
            if checkpoint.position < stored.position {
                return Err(CheckpointStoreError::PositionRegression {
                    stored: stored.position,
                    offered: checkpoint.position,
                });
            }
        }
        checkpoints.insert(checkpoint.name.clone(), checkpoint);
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<(), CheckpointStoreError> {
        self.checkpoints.write().await.remove(name);
        Ok(())
    }
}
