//! In-memory event store with live subscriptions

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use cv_domain::{EventData, EventEnvelope, EventStream};
use cv_ports::{
    validate_stream_id, EventStore, EventStoreError, EventSubscriber, EventSubscription,
    ExpectedVersion,
};
use glob::Pattern;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, instrument};

const SUBSCRIBE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct StreamSlot {
    version: u64,
    events: Vec<EventEnvelope>,
}

/// In-memory event store.
///
/// Appends to one stream serialize on that stream's mutex; appends to
/// distinct streams only contend on the short global-log push that assigns
/// the store-wide sequence. The broadcast feed carries every append in
/// global order.
pub struct MemoryEventStore {
    streams: RwLock<HashMap<String, Arc<Mutex<StreamSlot>>>>,
    log: Mutex<Vec<EventEnvelope>>,
    /// Never reused, even after a stream delete shrinks the log.
    next_global_seq: std::sync::atomic::AtomicU64,
    tx: broadcast::Sender<EventEnvelope>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBE_CHANNEL_CAPACITY);
        Self {
            streams: RwLock::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            next_global_seq: std::sync::atomic::AtomicU64::new(1),
            tx,
        }
    }

    async fn slot(&self, stream_id: &str) -> Arc<Mutex<StreamSlot>> {
        if let Some(slot) = self.streams.read().await.get(stream_id) {
            return Arc::clone(slot);
        }
        let mut streams = self.streams.write().await;
        Arc::clone(streams.entry(stream_id.to_string()).or_default())
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for MemoryEventStore {
    #[instrument(skip(self, events), fields(stream_id = %stream_id, event_count = events.len()))]
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventData>,
        expected_version: ExpectedVersion,
    ) -> Result<u64, EventStoreError> {
        validate_stream_id(stream_id)?;

        let slot = self.slot(stream_id).await;
        let mut slot = slot.lock().await;

        if let ExpectedVersion::Exact(expected) = expected_version {
            if slot.version != expected {
                debug!(
                    expected = expected,
                    actual = slot.version,
                    "concurrency conflict detected"
                );
                return Err(EventStoreError::ConcurrencyConflict {
                    expected,
                    actual: slot.version,
                });
            }
        }

        if events.is_empty() {
            return Ok(slot.version);
        }

        let occurred_at = Utc::now();
        let mut version = slot.version;

        // The global log lock both assigns the store-wide sequence and keeps
        // the broadcast feed ordered by it.
        let mut log = self.log.lock().await;
        for data in events {
            version += 1;
            let mut envelope = EventEnvelope::seal(stream_id, version, data, occurred_at);
            envelope.global_seq = Some(
                self.next_global_seq
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            );
            log.push(envelope.clone());
            slot.events.push(envelope.clone());
            let _ = self.tx.send(envelope);
        }
        drop(log);

        slot.version = version;
        Ok(version)
    }

    async fn read(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: usize,
    ) -> Result<EventStream, EventStoreError> {
        validate_stream_id(stream_id)?;

        let Some(slot) = self.streams.read().await.get(stream_id).map(Arc::clone) else {
            return Ok(EventStream::empty(stream_id));
        };
        let slot = slot.lock().await;

        let from_version = from_version.max(1);
        let events: Vec<EventEnvelope> = slot
            .events
            .iter()
            .filter(|e| e.version >= from_version)
            .take(max_count)
            .cloned()
            .collect();

        Ok(EventStream {
            stream_id: stream_id.to_string(),
            version: slot.version,
            events,
        })
    }

    async fn stream_exists(&self, stream_id: &str) -> Result<bool, EventStoreError> {
        validate_stream_id(stream_id)?;
        Ok(self.stream_version(stream_id).await? > 0)
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        validate_stream_id(stream_id)?;
        let Some(slot) = self.streams.read().await.get(stream_id).map(Arc::clone) else {
            return Ok(0);
        };
        let version = slot.lock().await.version;
        Ok(version)
    }

    #[instrument(skip(self))]
    async fn delete_stream(&self, stream_id: &str) -> Result<(), EventStoreError> {
        validate_stream_id(stream_id)?;
        let removed = self.streams.write().await.remove(stream_id);
        if removed.is_some() {
            // Deleted events also leave the replay feed.
            self.log
                .lock()
                .await
                .retain(|e| e.stream_id != stream_id);
            debug!(stream_id = stream_id, "stream deleted");
        }
        Ok(())
    }

    async fn list_streams(&self, pattern: &str) -> Result<Vec<String>, EventStoreError> {
        let pattern = Pattern::new(pattern).map_err(|_| EventStoreError::InvalidPattern {
            pattern: pattern.to_string(),
        })?;
        let streams = self.streams.read().await;
        let mut ids: Vec<String> = streams
            .keys()
            .filter(|id| pattern.matches(id))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn replay_all(
        &self,
        from_global_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self.log.lock().await;
        Ok(log
            .iter()
            .filter(|e| e.global_seq.unwrap_or(0) > from_global_seq)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl EventSubscriber for MemoryEventStore {
    fn subscribe_all(&self) -> EventSubscription {
        EventSubscription::new(self.tx.subscribe())
    }
}
