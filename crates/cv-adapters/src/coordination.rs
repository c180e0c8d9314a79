//! Coordination primitives: distributed lock, leader election, rate limiter,
//! and the cluster coordinator boundary.
//!
//! The in-memory variants coordinate tasks within one process and serve as
//! the reference semantics for consensus-backed backends: leases expire on
//! holder crash, leadership is lost unless renewed, windows are fixed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cv_domain::{CvResult, MediatorError};
use cv_ports::{
    Clock, ClusterCoordinator, DistributedLock, LeaderElection, LeaderError, LockError,
    RateLimiter, RateLimiterError, SystemClock,
};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, instrument};

/// Default node identity: hostname, pid, and a random suffix.
pub fn default_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix: u16 = rand::thread_rng().gen();
    format!("{host}-{}-{suffix:04x}", std::process::id())
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
    now.checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// Distributed lock
// ============================================================================

struct LockLease {
    token: u64,
    expires_at: DateTime<Utc>,
}

/// In-process exclusive lock with lease expiry.
///
/// A guard dropped without release frees the lock immediately; a holder that
/// disappears without dropping (the crash analogue) is displaced once its
/// lease expires.
pub struct MemoryLock {
    leases: Arc<StdMutex<HashMap<String, LockLease>>>,
    released: Arc<Notify>,
    tokens: AtomicU64,
    clock: Arc<dyn Clock>,
    /// Bound on how long `acquire` waits before giving up.
    patience: Duration,
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

impl MemoryLock {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(StdMutex::new(HashMap::new())),
            released: Arc::new(Notify::new()),
            tokens: AtomicU64::new(1),
            clock,
            patience: Duration::from_secs(30),
        }
    }

    pub fn with_patience(mut self, patience: Duration) -> Self {
        self.patience = patience;
        self
    }

    fn try_grab(&self, key: &str, ttl: Duration) -> Option<MemoryLockGuard> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap();
        match leases.get(key) {
            Some(lease) if lease.expires_at > now => None,
            _ => {
                let token = self.tokens.fetch_add(1, Ordering::Relaxed);
                leases.insert(
                    key.to_string(),
                    LockLease {
                        token,
                        expires_at: lease_expiry(now, ttl),
                    },
                );
                Some(MemoryLockGuard {
                    key: key.to_string(),
                    token,
                    leases: Arc::clone(&self.leases),
                    released: Arc::clone(&self.released),
                })
            }
        }
    }

    async fn acquire_with_deadline(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Option<MemoryLockGuard> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_grab(key, ttl) {
                return Some(guard);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // Wake on release, or poll for lease expiry.
            let nap = remaining.min(LOCK_POLL_INTERVAL);
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle held while a [`MemoryLock`] key is owned.
pub struct MemoryLockGuard {
    key: String,
    token: u64,
    leases: Arc<StdMutex<HashMap<String, LockLease>>>,
    released: Arc<Notify>,
}

impl MemoryLockGuard {
    /// Release explicitly; dropping the guard does the same.
    pub fn release(self) {}
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        let mut leases = self.leases.lock().unwrap();
        // Only remove our own lease: an expired lease may have been grabbed
        // by another holder already.
        if leases.get(&self.key).map(|l| l.token) == Some(self.token) {
            leases.remove(&self.key);
        }
        drop(leases);
        self.released.notify_waiters();
    }
}

impl DistributedLock for MemoryLock {
    type Guard = MemoryLockGuard;

    #[instrument(skip(self))]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Self::Guard, LockError> {
        self.acquire_with_deadline(key, ttl, self.patience)
            .await
            .ok_or_else(|| LockError::AcquireTimeout {
                key: key.to_string(),
            })
    }

    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<Self::Guard>, LockError> {
        Ok(self.acquire_with_deadline(key, ttl, timeout).await)
    }
}

// ============================================================================
// Leader election
// ============================================================================

struct LeaderLease {
    node_id: String,
    expires_at: DateTime<Utc>,
}

/// In-process lease-based leader election.
pub struct MemoryLeaderElection {
    leases: StdMutex<HashMap<String, LeaderLease>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLeaderElection {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: StdMutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryLeaderElection {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderElection for MemoryLeaderElection {
    #[instrument(skip(self))]
    async fn try_become_leader(
        &self,
        key: &str,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, LeaderError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap();
        match leases.get(key) {
            Some(lease) if lease.expires_at > now && lease.node_id != node_id => Ok(false),
            _ => {
                leases.insert(
                    key.to_string(),
                    LeaderLease {
                        node_id: node_id.to_string(),
                        expires_at: lease_expiry(now, ttl),
                    },
                );
                debug!(key = key, node_id = node_id, "leadership acquired");
                Ok(true)
            }
        }
    }

    async fn current_leader(&self, key: &str) -> Result<Option<String>, LeaderError> {
        let now = self.clock.now();
        let leases = self.leases.lock().unwrap();
        Ok(leases
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.node_id.clone()))
    }

    async fn renew(&self, key: &str, node_id: &str, ttl: Duration) -> Result<bool, LeaderError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(key) {
            Some(lease) if lease.node_id == node_id && lease.expires_at > now => {
                lease.expires_at = lease_expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resign(&self, key: &str, node_id: &str) -> Result<(), LeaderError> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(key).map(|l| l.node_id.as_str()) == Some(node_id) {
            leases.remove(key);
            debug!(key = key, node_id = node_id, "leadership resigned");
        }
        Ok(())
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

struct FixedWindow {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Fixed-window rate limiter per key.
pub struct MemoryRateLimiter {
    windows: StdMutex<HashMap<String, FixedWindow>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: StdMutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter for MemoryRateLimiter {
    async fn is_allowed(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, RateLimiterError> {
        let now = self.clock.now();
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        let mut windows = self.windows.lock().unwrap();

        let slot = windows.entry(key.to_string()).or_insert(FixedWindow {
            started_at: now,
            count: 0,
        });
        if now.signed_duration_since(slot.started_at) >= window {
            slot.started_at = now;
            slot.count = 0;
        }
        if slot.count < limit {
            slot.count += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ============================================================================
// Cluster coordinators
// ============================================================================

/// Pluggable request forwarder used by `forward`.
pub type ForwardFn =
    dyn Fn(String, Vec<u8>) -> BoxFuture<'static, CvResult<Vec<u8>>> + Send + Sync;

/// Coordinator with externally assigned leadership.
///
/// Single-node deployments pin `is_leader` to true; tests flip it to drive
/// leader-only and forwarding behaviors.
pub struct StaticClusterCoordinator {
    node_id: String,
    leader: AtomicBool,
    leader_endpoint: StdMutex<Option<String>>,
    forward_fn: StdMutex<Option<Arc<ForwardFn>>>,
}

impl StaticClusterCoordinator {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            leader: AtomicBool::new(false),
            leader_endpoint: StdMutex::new(None),
            forward_fn: StdMutex::new(None),
        }
    }

    /// Coordinator for a single-node deployment that always leads.
    pub fn single_node() -> Self {
        let coordinator = Self::new(default_node_id());
        coordinator.set_leader(true);
        coordinator
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn set_leader_endpoint(&self, endpoint: Option<String>) {
        *self.leader_endpoint.lock().unwrap() = endpoint;
    }

    pub fn set_forward_fn(&self, forward: Arc<ForwardFn>) {
        *self.forward_fn.lock().unwrap() = Some(forward);
    }
}

impl ClusterCoordinator for StaticClusterCoordinator {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn leader_endpoint(&self) -> Option<String> {
        self.leader_endpoint.lock().unwrap().clone()
    }

    async fn execute_if_leader<F, Fut, T>(&self, work: F) -> CvResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = CvResult<T>> + Send,
        T: Send,
    {
        if self.is_leader().await {
            work().await
        } else {
            let endpoint = self.leader_endpoint().await;
            Err(MediatorError::not_leader(endpoint.as_deref()))
        }
    }

    async fn forward(&self, message_type: &str, payload: Vec<u8>) -> CvResult<Vec<u8>> {
        let forward = self.forward_fn.lock().unwrap().clone();
        match forward {
            Some(forward) => forward(message_type.to_string(), payload).await,
            None => Err(MediatorError::transient(
                "no forward transport configured for this node",
            )),
        }
    }
}

/// Coordinator deriving leadership from a [`LeaderElection`] lease.
///
/// Endpoints are a static node-to-address map supplied at construction;
/// request forwarding still needs a transport and stays pluggable.
pub struct LeaseClusterCoordinator<L> {
    election: Arc<L>,
    key: String,
    node_id: String,
    ttl: Duration,
    endpoints: HashMap<String, String>,
    forward_fn: StdMutex<Option<Arc<ForwardFn>>>,
}

impl<L: LeaderElection> LeaseClusterCoordinator<L> {
    pub fn new(
        election: Arc<L>,
        key: impl Into<String>,
        node_id: impl Into<String>,
        ttl: Duration,
        endpoints: HashMap<String, String>,
    ) -> Self {
        Self {
            election,
            key: key.into(),
            node_id: node_id.into(),
            ttl,
            endpoints,
            forward_fn: StdMutex::new(None),
        }
    }

    pub fn set_forward_fn(&self, forward: Arc<ForwardFn>) {
        *self.forward_fn.lock().unwrap() = Some(forward);
    }

    /// Claim or extend the leadership lease. Called on the renewal cadence.
    pub async fn campaign(&self) -> Result<bool, LeaderError> {
        if self
            .election
            .renew(&self.key, &self.node_id, self.ttl)
            .await?
        {
            return Ok(true);
        }
        self.election
            .try_become_leader(&self.key, &self.node_id, self.ttl)
            .await
    }
}

impl<L: LeaderElection> ClusterCoordinator for LeaseClusterCoordinator<L> {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn is_leader(&self) -> bool {
        matches!(
            self.election.current_leader(&self.key).await,
            Ok(Some(leader)) if leader == self.node_id
        )
    }

    async fn leader_endpoint(&self) -> Option<String> {
        let leader = self.election.current_leader(&self.key).await.ok()??;
        self.endpoints.get(&leader).cloned()
    }

    async fn execute_if_leader<F, Fut, T>(&self, work: F) -> CvResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = CvResult<T>> + Send,
        T: Send,
    {
        if self.is_leader().await {
            work().await
        } else {
            let endpoint = self.leader_endpoint().await;
            Err(MediatorError::not_leader(endpoint.as_deref()))
        }
    }

    async fn forward(&self, message_type: &str, payload: Vec<u8>) -> CvResult<Vec<u8>> {
        let forward = self.forward_fn.lock().unwrap().clone();
        match forward {
            Some(forward) => forward(message_type.to_string(), payload).await,
            None => Err(MediatorError::transient(
                "no forward transport configured for this node",
            )),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ManualClock;
    use cv_domain::ErrorKind;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let lock = MemoryLock::new();
        let guard = lock
            .acquire("jobs", Duration::from_secs(30))
            .await
            .unwrap();

        let contender = lock
            .try_acquire("jobs", Duration::from_secs(30), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(contender.is_none());

        guard.release();
        let contender = lock
            .try_acquire("jobs", Duration::from_secs(30), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(contender.is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_displaced() {
        let clock = Arc::new(ManualClock::default());
        let lock = MemoryLock::with_clock(clock.clone());
        let first = lock.acquire("k", Duration::from_secs(10)).await.unwrap();

        clock.advance(ChronoDuration::seconds(11));
        let second = lock
            .try_acquire("k", Duration::from_secs(10), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(second.is_some());

        // The displaced guard must not free the new holder's lease.
        drop(first);
        let third = lock
            .try_acquire("k", Duration::from_secs(10), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let lock = Arc::new(MemoryLock::new());
        let guard = lock.acquire("k", Duration::from_secs(30)).await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("k", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);

        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn at_most_one_leader_per_key() {
        let election = MemoryLeaderElection::new();
        let ttl = Duration::from_secs(30);

        assert!(election.try_become_leader("shard", "a", ttl).await.unwrap());
        assert!(!election.try_become_leader("shard", "b", ttl).await.unwrap());
        assert_eq!(
            election.current_leader("shard").await.unwrap().as_deref(),
            Some("a")
        );

        // Re-claiming by the current holder stays true.
        assert!(election.try_become_leader("shard", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn leadership_lapses_without_renewal() {
        let clock = Arc::new(ManualClock::default());
        let election = MemoryLeaderElection::with_clock(clock.clone());
        let ttl = Duration::from_secs(10);

        assert!(election.try_become_leader("k", "a", ttl).await.unwrap());
        assert!(election.renew("k", "a", ttl).await.unwrap());

        clock.advance(ChronoDuration::seconds(11));
        assert!(!election.renew("k", "a", ttl).await.unwrap());
        assert!(election.current_leader("k").await.unwrap().is_none());
        assert!(election.try_become_leader("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn resign_frees_the_key_for_others() {
        let election = MemoryLeaderElection::new();
        let ttl = Duration::from_secs(30);
        election.try_become_leader("k", "a", ttl).await.unwrap();

        election.resign("k", "b").await.unwrap();
        assert_eq!(
            election.current_leader("k").await.unwrap().as_deref(),
            Some("a")
        );

        election.resign("k", "a").await.unwrap();
        assert!(election.try_become_leader("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn rate_limiter_denies_past_the_limit() {
        let clock = Arc::new(ManualClock::default());
        let limiter = MemoryRateLimiter::with_clock(clock.clone());
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert!(limiter.is_allowed("api", 5, window).await.unwrap());
        }
        assert!(!limiter.is_allowed("api", 5, window).await.unwrap());

        // Other keys have their own budget; a fresh window resets ours.
        assert!(limiter.is_allowed("other", 5, window).await.unwrap());
        clock.advance(ChronoDuration::seconds(61));
        assert!(limiter.is_allowed("api", 5, window).await.unwrap());
    }

    #[tokio::test]
    async fn static_coordinator_gates_leader_work() {
        let coordinator = StaticClusterCoordinator::new("node-b");
        coordinator.set_leader_endpoint(Some("node-a:7400".to_string()));

        let err = coordinator
            .execute_if_leader(|| async { Ok(1) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotLeader);
        assert!(err.message.contains("node-a:7400"));

        coordinator.set_leader(true);
        let value = coordinator
            .execute_if_leader(|| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn lease_coordinator_follows_the_election() {
        let election = Arc::new(MemoryLeaderElection::new());
        let endpoints = HashMap::from([
            ("a".to_string(), "a:7400".to_string()),
            ("b".to_string(), "b:7400".to_string()),
        ]);
        let ttl = Duration::from_secs(30);
        let a = LeaseClusterCoordinator::new(
            Arc::clone(&election),
            "cluster",
            "a",
            ttl,
            endpoints.clone(),
        );
        let b = LeaseClusterCoordinator::new(Arc::clone(&election), "cluster", "b", ttl, endpoints);

        assert!(a.campaign().await.unwrap());
        assert!(a.is_leader().await);
        assert!(!b.campaign().await.unwrap());
        assert!(!b.is_leader().await);
        assert_eq!(b.leader_endpoint().await.as_deref(), Some("a:7400"));
    }
}
