//! In-memory outbox store

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cv_domain::OutboxMessage;
use cv_ports::{Clock, OutboxError, OutboxStore, SystemClock};
use tokio::sync::RwLock;

/// In-memory outbox rows.
///
/// `pending` returns FIFO by `created_at`; marking is idempotent so a
/// processor crashing between dispatch and mark can safely re-mark after
/// replay.
pub struct MemoryOutboxStore {
    messages: RwLock<HashMap<String, OutboxMessage>>,
    clock: Arc<dyn Clock>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.messages
            .read()
            .await
            .values()
            .filter(|m| !m.is_processed())
            .count()
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxStore for MemoryOutboxStore {
    async fn add(&self, message: OutboxMessage) -> Result<(), OutboxError> {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message);
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let messages = self.messages.read().await;
        let mut pending: Vec<OutboxMessage> = messages
            .values()
            .filter(|m| !m.is_processed())
            .cloned()
            .collect();
        // FIFO by creation time, id as the stable tiebreaker.
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), OutboxError> {
        let mut messages = self.messages.write().await;
        if let Some(message) = messages.get_mut(id) {
            if message.processed_at.is_none() {
                message.processed_at = Some(self.clock.now());
            }
        }
        Ok(())
    }

    async fn record_attempt(&self, id: &str) -> Result<u32, OutboxError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(id)
            .ok_or_else(|| OutboxError::MessageNotFound { id: id.to_string() })?;
        message.attempts += 1;
        Ok(message.attempts)
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| match m.processed_at {
            Some(processed_at) => processed_at >= older_than,
            None => true,
        });
        Ok(before - messages.len())
    }
}
