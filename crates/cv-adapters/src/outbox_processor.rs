//! Outbox processor
//!
//! Drains pending outbox rows and hands them to the external transport:
//! - at-least-once: a crash between dispatch and mark re-delivers on restart
//! - exponential backoff with jitter per message
//! - messages out of attempts land in the dead letter store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cv_domain::{CvResult, DeadLetter, MediatorError, OutboxMessage};
use cv_ports::{CancellationToken, DeadLetterStore, OutboxError, OutboxStore};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OutboxSettings;

/// Queue name dead-lettered outbox messages are filed under.
pub const OUTBOX_DLQ_QUEUE: &str = "outbox";

/// Transport hook invoked per message.
pub trait OutboxDispatcher: Send + Sync {
    fn dispatch(
        &self,
        message: &OutboxMessage,
    ) -> impl std::future::Future<Output = CvResult<()>> + Send;
}

/// Outbox processor configuration
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&OutboxSettings> for OutboxProcessorConfig {
    fn from(settings: &OutboxSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_attempts: settings.max_attempts,
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

/// Leases pending batches and dispatches them through the transport hook.
pub struct OutboxProcessor<S, D, L> {
    outbox: Arc<S>,
    dispatcher: Arc<D>,
    dead_letters: Arc<L>,
    config: OutboxProcessorConfig,
    /// Per-message earliest next dispatch, driven by backoff.
    next_due: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl<S, D, L> OutboxProcessor<S, D, L>
where
    S: OutboxStore,
    D: OutboxDispatcher,
    L: DeadLetterStore,
{
    pub fn new(outbox: Arc<S>, dispatcher: Arc<D>, dead_letters: Arc<L>) -> Self {
        Self::with_config(
            outbox,
            dispatcher,
            dead_letters,
            OutboxProcessorConfig::default(),
        )
    }

    pub fn with_config(
        outbox: Arc<S>,
        dispatcher: Arc<D>,
        dead_letters: Arc<L>,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self {
            outbox,
            dispatcher,
            dead_letters,
            config,
            next_due: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self
            .config
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.max_backoff);
        let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter)
    }

    /// One drain pass. Returns the number of messages dispatched.
    #[instrument(skip(self))]
    pub async fn process_batch(&self) -> Result<usize, OutboxError> {
        let pending = self.outbox.pending(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let now = tokio::time::Instant::now();
        let mut dispatched = 0;

        for message in pending {
            if self
                .next_due
                .lock()
                .await
                .get(&message.id)
                .is_some_and(|due| *due > now)
            {
                continue;
            }

            match self.dispatcher.dispatch(&message).await {
                Ok(()) => {
                    self.outbox.mark_processed(&message.id).await?;
                    self.next_due.lock().await.remove(&message.id);
                    dispatched += 1;
                    debug!(id = %message.id, message_type = %message.message_type, "outbox message dispatched");
                }
                Err(e) => {
                    let attempts = self.outbox.record_attempt(&message.id).await?;
                    if attempts >= self.config.max_attempts {
                        self.dead_letter(&message, &e, attempts).await?;
                    } else {
                        let delay = self.backoff(attempts);
                        self.next_due
                            .lock()
                            .await
                            .insert(message.id.clone(), now + delay);
                        warn!(
                            id = %message.id,
                            attempts = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "outbox dispatch failed, backing off"
                        );
                    }
                }
            }
        }

        if dispatched > 0 {
            info!(dispatched = dispatched, "outbox batch processed");
        }
        Ok(dispatched)
    }

    async fn dead_letter(
        &self,
        message: &OutboxMessage,
        cause: &MediatorError,
        attempts: u32,
    ) -> Result<(), OutboxError> {
        error!(
            id = %message.id,
            attempts = attempts,
            error = %cause,
            "outbox message out of attempts, dead-lettering"
        );

        let mut letter = DeadLetter::new(
            message.id.clone(),
            OUTBOX_DLQ_QUEUE,
            message.payload.clone(),
            cause.to_string(),
            Utc::now(),
        )
        .with_retry_count(attempts)
        .with_header("message_type", message.message_type.clone());
        if let Some(stream_id) = &message.stream_id {
            letter = letter.with_header("stream_id", stream_id.clone());
        }
        letter.permanent = !cause.is_retriable();

        self.dead_letters
            .add(letter)
            .await
            .map_err(|e| OutboxError::StorageUnavailable {
                message: e.to_string(),
            })?;

        // Remove from the pending set; the dead letter store owns it now.
        self.outbox.mark_processed(&message.id).await?;
        self.next_due.lock().await.remove(&message.id);
        Ok(())
    }

    /// Poll until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.process_batch().await {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "outbox pass failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDeadLetterStore, MemoryOutboxStore};
    use cv_ports::DeadLetterStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Dispatcher failing the first `failures` calls per message type.
    struct FlakyDispatcher {
        calls: AtomicU32,
        failures: u32,
        retriable: bool,
    }

    impl FlakyDispatcher {
        fn failing(failures: u32, retriable: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                retriable,
            }
        }
    }

    impl OutboxDispatcher for FlakyDispatcher {
        async fn dispatch(&self, _message: &OutboxMessage) -> CvResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.retriable {
                    Err(MediatorError::transient("broker down"))
                } else {
                    Err(MediatorError::validation("poison payload"))
                }
            } else {
                Ok(())
            }
        }
    }

    fn processor_config() -> OutboxProcessorConfig {
        OutboxProcessorConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    async fn stage(outbox: &MemoryOutboxStore, message_type: &str) -> String {
        let message = OutboxMessage::new(message_type, b"{}".to_vec(), Utc::now());
        let id = message.id.clone();
        outbox.add(message).await.unwrap();
        id
    }

    #[tokio::test]
    async fn dispatches_and_marks_processed() {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let dispatcher = Arc::new(FlakyDispatcher::failing(0, true));
        let processor = OutboxProcessor::with_config(
            Arc::clone(&outbox),
            dispatcher,
            Arc::clone(&dlq),
            processor_config(),
        );

        stage(&outbox, "OrderCreatedEvent").await;
        stage(&outbox, "OrderPaidEvent").await;

        assert_eq!(processor.process_batch().await.unwrap(), 2);
        assert_eq!(outbox.pending_count().await, 0);
        assert_eq!(dlq.count(OUTBOX_DLQ_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn retries_with_backoff_until_success() {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let dispatcher = Arc::new(FlakyDispatcher::failing(2, true));
        let processor = OutboxProcessor::with_config(
            Arc::clone(&outbox),
            dispatcher,
            Arc::clone(&dlq),
            processor_config(),
        );

        stage(&outbox, "OrderCreatedEvent").await;

        let mut dispatched = 0;
        for _ in 0..20 {
            dispatched += processor.process_batch().await.unwrap();
            if dispatched > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatched, 1);
        assert_eq!(outbox.pending_count().await, 0);
        assert_eq!(dlq.count(OUTBOX_DLQ_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn exhausted_messages_land_in_dlq() {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let dispatcher = Arc::new(FlakyDispatcher::failing(u32::MAX, false));
        let processor = OutboxProcessor::with_config(
            Arc::clone(&outbox),
            dispatcher,
            Arc::clone(&dlq),
            processor_config(),
        );

        let id = stage(&outbox, "OrderCreatedEvent").await;

        for _ in 0..20 {
            processor.process_batch().await.unwrap();
            if dlq.count(OUTBOX_DLQ_QUEUE).await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let letters = dlq.list(OUTBOX_DLQ_QUEUE, 0, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message_id, id);
        assert_eq!(letters[0].retry_count, 3);
        assert!(letters[0].permanent);
        assert_eq!(outbox.pending_count().await, 0);
    }

    #[tokio::test]
    async fn run_drains_until_cancelled() {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let dispatcher = Arc::new(FlakyDispatcher::failing(0, true));
        let processor = Arc::new(OutboxProcessor::with_config(
            Arc::clone(&outbox),
            dispatcher,
            dlq,
            processor_config(),
        ));

        stage(&outbox, "OrderCreatedEvent").await;

        let cancel = CancellationToken::new();
        let task = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.run(cancel).await })
        };

        for _ in 0..100 {
            if outbox.pending_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outbox.pending_count().await, 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("processor should stop on cancel")
            .unwrap();
    }
}
