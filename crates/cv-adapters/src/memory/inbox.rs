//! In-memory inbox store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use cv_domain::{InboxRecord, MessageId};
use cv_ports::{Clock, InboxError, InboxStore, SystemClock};
use tokio::sync::Mutex;

/// In-memory duplicate-delivery guard.
///
/// The single mutex makes `try_store` atomic: of N concurrent calls for the
/// same id, exactly one observes absence.
pub struct MemoryInboxStore {
    records: Mutex<HashMap<MessageId, InboxRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryInboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryInboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxStore for MemoryInboxStore {
    async fn try_store(&self, message_id: MessageId, ttl: Duration) -> Result<bool, InboxError> {
        let now = self.clock.now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        let mut records = self.records.lock().await;

        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        match records.get(&message_id) {
            Some(record) if !record.is_expired(now) => Ok(false),
            _ => {
                records.insert(message_id, InboxRecord::new(message_id, expires_at));
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self) -> Result<usize, InboxError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ManualClock;

    #[tokio::test]
    async fn first_insertion_wins_exactly_once() {
        let inbox = MemoryInboxStore::new();
        let id = MessageId::next();
        assert!(inbox.try_store(id, Duration::from_secs(60)).await.unwrap());
        assert!(!inbox.try_store(id, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_stores_admit_one() {
        let inbox = Arc::new(MemoryInboxStore::new());
        let id = MessageId::next();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let inbox = Arc::clone(&inbox);
                tokio::spawn(async move { inbox.try_store(id, Duration::from_secs(60)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn expired_marker_counts_as_absent() {
        let clock = Arc::new(ManualClock::default());
        let inbox = MemoryInboxStore::with_clock(clock.clone());
        let id = MessageId::next();

        assert!(inbox.try_store(id, Duration::from_secs(10)).await.unwrap());
        clock.advance(ChronoDuration::seconds(11));
        assert!(inbox.try_store(id, Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_expired_markers() {
        let clock = Arc::new(ManualClock::default());
        let inbox = MemoryInboxStore::with_clock(clock.clone());
        inbox
            .try_store(MessageId::next(), Duration::from_secs(5))
            .await
            .unwrap();
        inbox
            .try_store(MessageId::next(), Duration::from_secs(500))
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(6));
        assert_eq!(inbox.purge_expired().await.unwrap(), 1);
    }
}
