//! In-memory idempotency store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cv_ports::{Clock, IdempotencyError, IdempotencyStore, SystemClock};
use tokio::sync::RwLock;

struct CachedResult {
    result: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// In-memory request-result cache with lazy ttl expiry.
pub struct MemoryIdempotencyStore {
    results: RwLock<HashMap<String, CachedResult>>,
    clock: Arc<dyn Clock>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    async fn store(
        &self,
        request_id: &str,
        result: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.results.write().await.insert(
            request_id.to_string(),
            CachedResult { result, expires_at },
        );
        Ok(())
    }

    async fn is_processed(&self, request_id: &str) -> Result<bool, IdempotencyError> {
        Ok(self.get(request_id).await?.is_some())
    }

    async fn get(&self, request_id: &str) -> Result<Option<serde_json::Value>, IdempotencyError> {
        let now = self.clock.now();
        let results = self.results.read().await;
        Ok(results
            .get(request_id)
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.result.clone()))
    }
}
