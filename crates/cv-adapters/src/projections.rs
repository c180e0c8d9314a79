//! Projection runtime
//!
//! Materializes read models from the event log. Key properties:
//! - Deterministic: rebuilding from scratch matches incremental results
//! - Tracks the last processed store-wide sequence per projection
//! - `apply` is serialized per projection instance; readers never observe a
//!   half-rebuilt model

use std::sync::Arc;

use chrono::Utc;
use cv_ports::{
    CancellationToken, Checkpoint, CheckpointStore, CheckpointStoreError, EventStore,
    EventStoreError, EventSubscriber, Projection, ProjectionApplyError, SubscriptionError,
};
use glob::Pattern;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Projection runtime error types
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointStoreError),

    #[error("apply error: {0}")]
    Apply(#[from] ProjectionApplyError),

    #[error("invalid stream pattern: {pattern}")]
    InvalidPattern { pattern: String },
}

/// Projection runtime configuration
#[derive(Debug, Clone)]
pub struct ProjectionRuntimeConfig {
    /// Events read per catch-up batch
    pub batch_size: usize,
}

impl Default for ProjectionRuntimeConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Drives one projection from a checkpoint through the event feed.
///
/// Readers access the model through [`ProjectionRuntime::with_projection`];
/// a rebuild works on a private clone and swaps it in atomically, so reads
/// during a rebuild see the pre-rebuild state.
pub struct ProjectionRuntime<P, ES, CS> {
    projection: Arc<RwLock<P>>,
    event_store: Arc<ES>,
    checkpoints: Arc<CS>,
    config: ProjectionRuntimeConfig,
    name: String,
    stream_pattern: String,
    /// Held across a rebuild so live applies wait for the swap.
    apply_gate: Mutex<()>,
}

impl<P, ES, CS> ProjectionRuntime<P, ES, CS>
where
    P: Projection,
    ES: EventStore,
    CS: CheckpointStore,
{
    pub fn new(projection: P, event_store: Arc<ES>, checkpoints: Arc<CS>) -> Self {
        Self::with_config(
            projection,
            event_store,
            checkpoints,
            ProjectionRuntimeConfig::default(),
        )
    }

    pub fn with_config(
        projection: P,
        event_store: Arc<ES>,
        checkpoints: Arc<CS>,
        config: ProjectionRuntimeConfig,
    ) -> Self {
        let name = projection.name().to_string();
        let stream_pattern = projection.stream_pattern().to_string();
        Self {
            projection: Arc::new(RwLock::new(projection)),
            event_store,
            checkpoints,
            config,
            name,
            stream_pattern,
            apply_gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read access to the current model.
    pub async fn with_projection<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let projection = self.projection.read().await;
        f(&projection)
    }

    fn pattern(&self) -> Result<Pattern, ProjectionError> {
        Pattern::new(&self.stream_pattern).map_err(|_| ProjectionError::InvalidPattern {
            pattern: self.stream_pattern.clone(),
        })
    }

    async fn checkpoint(&self) -> Result<Checkpoint, ProjectionError> {
        Ok(self
            .checkpoints
            .get(&self.name)
            .await?
            .unwrap_or_else(|| Checkpoint::initial(&self.name, &self.stream_pattern)))
    }

    /// Fold every unprocessed event into the model. Returns the number of
    /// events applied.
    #[instrument(skip(self), fields(projection = %self.name))]
    pub async fn catch_up(&self) -> Result<usize, ProjectionError> {
        let _gate = self.apply_gate.lock().await;
        self.catch_up_locked().await
    }

    async fn catch_up_locked(&self) -> Result<usize, ProjectionError> {
        let pattern = self.pattern()?;
        let mut checkpoint = self.checkpoint().await?;
        let mut applied = 0;

        loop {
            let batch = self
                .event_store
                .replay_all(checkpoint.position, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut projection = self.projection.write().await;
            for envelope in &batch {
                if pattern.matches(&envelope.stream_id) {
                    projection.apply(envelope)?;
                    checkpoint.processed_count += 1;
                    applied += 1;
                }
                checkpoint.position = envelope.global_seq.unwrap_or(checkpoint.position);
            }
            drop(projection);

            checkpoint.last_processed_at = Utc::now();
            self.checkpoints.put(checkpoint.clone()).await?;
        }

        if applied > 0 {
            debug!(applied = applied, position = checkpoint.position, "caught up");
        }
        Ok(applied)
    }

    /// Reset the model and replay the whole log.
    ///
    /// The replay folds into a private clone; the live model is swapped once
    /// the clone is complete, so concurrent readers never see partial state.
    #[instrument(skip(self), fields(projection = %self.name))]
    pub async fn rebuild(&self) -> Result<usize, ProjectionError>
    where
        P: Clone,
    {
        let _gate = self.apply_gate.lock().await;
        let pattern = self.pattern()?;

        let mut rebuilt = self.projection.read().await.clone();
        rebuilt.reset();
        let mut checkpoint = Checkpoint::initial(&self.name, &self.stream_pattern);
        let mut applied = 0;

        loop {
            let batch = self
                .event_store
                .replay_all(checkpoint.position, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            for envelope in &batch {
                if pattern.matches(&envelope.stream_id) {
                    rebuilt.apply(envelope)?;
                    checkpoint.processed_count += 1;
                    applied += 1;
                }
                checkpoint.position = envelope.global_seq.unwrap_or(checkpoint.position);
            }
        }

        checkpoint.last_processed_at = Utc::now();
        self.checkpoints.reset(&self.name).await?;
        *self.projection.write().await = rebuilt;
        self.checkpoints.put(checkpoint).await?;

        info!(applied = applied, "projection rebuilt");
        Ok(applied)
    }

    /// Follow the live feed until cancelled.
    ///
    /// Falls back to catch-up reads whenever the feed skips ahead or lags.
    #[instrument(skip(self, cancel), fields(projection = %self.name))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProjectionError>
    where
        ES: EventSubscriber,
    {
        let mut subscription = self.event_store.subscribe_all();
        self.catch_up().await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = subscription.next() => match next {
                    Ok(envelope) => {
                        let _gate = self.apply_gate.lock().await;
                        let mut checkpoint = self.checkpoint().await?;
                        let seq = envelope.global_seq.unwrap_or(0);
                        if seq <= checkpoint.position {
                            continue;
                        }
                        if seq != checkpoint.position + 1 {
                            // Out-of-order delivery; the ordered log is the
                            // source of truth.
                            drop(_gate);
                            self.catch_up().await?;
                            continue;
                        }
                        let pattern = self.pattern()?;
                        if pattern.matches(&envelope.stream_id) {
                            self.projection.write().await.apply(&envelope)?;
                            checkpoint.processed_count += 1;
                        }
                        checkpoint.position = seq;
                        checkpoint.last_processed_at = Utc::now();
                        self.checkpoints.put(checkpoint).await?;
                    }
                    Err(SubscriptionError::Lagged(missed)) => {
                        warn!(missed = missed, "subscription lagged, catching up");
                        self.catch_up().await?;
                    }
                    Err(SubscriptionError::Closed) => return Ok(()),
                },
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
