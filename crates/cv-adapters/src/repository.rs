//! Aggregate repository
//!
//! Load = latest snapshot + fold of the events appended since; save = append
//! with the caller's expected version, then snapshot on the configured
//! cadence. Snapshot writes are accel only; losing one never loses state.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use cv_domain::{fold_from, Aggregate, CvResult, EventData, MediatorError, SnapshotRecord};
use cv_ports::{EventStore, ExpectedVersion, SnapshotStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

const DEFAULT_SNAPSHOT_EVERY: u64 = 50;

/// Event-sourced repository for one aggregate type.
pub struct AggregateRepository<A, ES, SS> {
    event_store: Arc<ES>,
    snapshots: Arc<SS>,
    snapshot_every: u64,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, ES, SS> AggregateRepository<A, ES, SS>
where
    A: Aggregate + Serialize + DeserializeOwned,
    ES: EventStore,
    SS: SnapshotStore,
{
    pub fn new(event_store: Arc<ES>, snapshots: Arc<SS>) -> Self {
        Self {
            event_store,
            snapshots,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            _aggregate: PhantomData,
        }
    }

    /// Snapshot whenever the stream version crosses a multiple of `every`.
    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every.max(1);
        self
    }

    /// Load an aggregate and its current stream version.
    #[instrument(skip(self), fields(aggregate = %A::type_name()))]
    pub async fn load(&self, id: &str) -> CvResult<Option<(A, u64)>> {
        let stream_id = A::stream_id(id);

        let snapshot = self.snapshots.get(&stream_id).await?;
        let (initial, from_version) = match snapshot {
            Some(record) => {
                let state: A = record.state_as().map_err(|e| {
                    MediatorError::fatal(format!(
                        "undecodable snapshot for {stream_id}@{}: {e}",
                        record.version
                    ))
                })?;
                (Some(state), record.version + 1)
            }
            None => (None, 1),
        };

        let stream = self
            .event_store
            .read(&stream_id, from_version, usize::MAX)
            .await?;
        let version = stream.version;
        let state = fold_from(initial, &stream.events)?;

        Ok(state.map(|s| (s, version)))
    }

    /// Append new events for an aggregate at the expected version.
    ///
    /// `state` must already reflect the new events; it is what a cadence
    /// snapshot captures. Returns the new stream version.
    #[instrument(skip(self, state, events), fields(aggregate = %A::type_name(), event_count = events.len()))]
    pub async fn save(
        &self,
        id: &str,
        state: &A,
        events: Vec<A::Event>,
        expected_version: u64,
    ) -> CvResult<u64> {
        if events.is_empty() {
            return Ok(expected_version);
        }
        let stream_id = A::stream_id(id);

        let mut data = Vec::with_capacity(events.len());
        for event in &events {
            let encoded =
                EventData::encode(A::event_type(event), event).map_err(|e| {
                    MediatorError::fatal(format!("unencodable event for {stream_id}: {e}"))
                })?;
            data.push(encoded);
        }

        let new_version = self
            .event_store
            .append(&stream_id, data, ExpectedVersion::Exact(expected_version))
            .await?;

        if self.crossed_snapshot_cadence(expected_version, new_version) {
            let record = SnapshotRecord::of(&stream_id, new_version, state, Utc::now())
                .map_err(|e| MediatorError::fatal(format!("unencodable snapshot: {e}")))?;
            self.snapshots.save(record).await?;
            debug!(stream_id = %stream_id, version = new_version, "snapshot taken");
        }

        Ok(new_version)
    }

    fn crossed_snapshot_cadence(&self, old_version: u64, new_version: u64) -> bool {
        old_version / self.snapshot_every < new_version / self.snapshot_every
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEventStore, MemorySnapshotStore};
    use cv_ports::SnapshotStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum TallyEvent {
        Opened,
        Added(i64),
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Tally {
        id: String,
        total: i64,
    }

    impl Aggregate for Tally {
        type Event = TallyEvent;

        fn type_name() -> &'static str {
            "Tally"
        }

        fn aggregate_id(&self) -> &str {
            &self.id
        }

        fn event_type(event: &Self::Event) -> &'static str {
            match event {
                TallyEvent::Opened => "TallyOpenedEvent",
                TallyEvent::Added(_) => "TallyAddedEvent",
            }
        }

        fn apply(state: Option<Self>, event: Self::Event) -> CvResult<Self> {
            match (state, event) {
                (None, TallyEvent::Opened) => Ok(Tally {
                    id: "t1".into(),
                    total: 0,
                }),
                (Some(mut t), TallyEvent::Added(n)) => {
                    t.total += n;
                    Ok(t)
                }
                _ => Err(MediatorError::fatal("unexpected event for tally state")),
            }
        }
    }

    fn repository(
        store: &Arc<MemoryEventStore>,
        snapshots: &Arc<MemorySnapshotStore>,
    ) -> AggregateRepository<Tally, MemoryEventStore, MemorySnapshotStore> {
        AggregateRepository::new(Arc::clone(store), Arc::clone(snapshots)).with_snapshot_every(2)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = Arc::new(MemoryEventStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let repo = repository(&store, &snapshots);

        assert!(repo.load("t1").await.unwrap().is_none());

        let state = Tally {
            id: "t1".into(),
            total: 0,
        };
        let version = repo
            .save("t1", &state, vec![TallyEvent::Opened], 0)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let state = Tally {
            id: "t1".into(),
            total: 12,
        };
        let version = repo
            .save("t1", &state, vec![TallyEvent::Added(5), TallyEvent::Added(7)], 1)
            .await
            .unwrap();
        assert_eq!(version, 3);

        let (loaded, loaded_version) = repo.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded_version, 3);
        assert_eq!(loaded.total, 12);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = Arc::new(MemoryEventStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let repo = repository(&store, &snapshots);

        let state = Tally {
            id: "t1".into(),
            total: 0,
        };
        repo.save("t1", &state, vec![TallyEvent::Opened], 0)
            .await
            .unwrap();

        let err = repo
            .save("t1", &state, vec![TallyEvent::Added(1)], 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind, cv_domain::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn load_resumes_from_snapshot() {
        let store = Arc::new(MemoryEventStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let repo = repository(&store, &snapshots);

        let mut state = Tally {
            id: "t1".into(),
            total: 0,
        };
        repo.save("t1", &state, vec![TallyEvent::Opened], 0)
            .await
            .unwrap();
        state.total = 9;
        repo.save("t1", &state, vec![TallyEvent::Added(9)], 1)
            .await
            .unwrap();

        // Cadence of 2 means version 2 produced a snapshot.
        let snapshot = snapshots.get("Tally-t1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);

        state.total = 14;
        repo.save("t1", &state, vec![TallyEvent::Added(5)], 2)
            .await
            .unwrap();

        let (loaded, version) = repo.load("t1").await.unwrap().unwrap();
        assert_eq!(version, 3);
        assert_eq!(loaded.total, 14);
    }
}
