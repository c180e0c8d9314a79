//! Cluster coordination ports: locks, leadership, rate limiting

use std::future::Future;
use std::time::Duration;

use cv_domain::{CvResult, MediatorError};

/// Distributed lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock acquire timed out for key {key}")]
    AcquireTimeout { key: String },

    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },
}

impl From<LockError> for MediatorError {
    fn from(e: LockError) -> Self {
        MediatorError::transient(e.to_string())
    }
}

/// Exclusive lock by key with a lease ttl.
///
/// Leases auto-expire when the holder crashes, so a guard going out of scope
/// without an explicit release only delays other waiters, never deadlocks
/// them.
pub trait DistributedLock: Send + Sync {
    /// Handle held while the lock is owned; dropping it releases the lock.
    type Guard: Send + 'static;

    /// Wait (bounded by the backend's configured patience) until the lock is
    /// acquired.
    fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Self::Guard, LockError>> + Send;

    /// Try for up to `timeout`; `None` when contention wins.
    fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Self::Guard>, LockError>> + Send;
}

/// Leader election errors
#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },
}

impl From<LeaderError> for MediatorError {
    fn from(e: LeaderError) -> Self {
        MediatorError::transient(e.to_string())
    }
}

/// Lease-based leader election per key.
///
/// At most one node holds a key at a time; leaders must renew before the ttl
/// elapses or lose the lease.
pub trait LeaderElection: Send + Sync {
    fn try_become_leader(
        &self,
        key: &str,
        node_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LeaderError>> + Send;

    fn current_leader(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, LeaderError>> + Send;

    /// Extend an existing lease. Returns `false` when the lease was already
    /// lost.
    fn renew(
        &self,
        key: &str,
        node_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LeaderError>> + Send;

    /// Give up leadership voluntarily. No-op when not the leader.
    fn resign(
        &self,
        key: &str,
        node_id: &str,
    ) -> impl Future<Output = Result<(), LeaderError>> + Send;
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimiterError {
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },
}

impl From<RateLimiterError> for MediatorError {
    fn from(e: RateLimiterError) -> Self {
        MediatorError::transient(e.to_string())
    }
}

/// Per-key request budget over a time window.
pub trait RateLimiter: Send + Sync {
    /// Whether one more call fits the budget. The call at exactly `limit`
    /// within a window is denied.
    fn is_allowed(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> impl Future<Output = Result<bool, RateLimiterError>> + Send;
}

/// Boundary to the cluster runtime a node participates in.
///
/// Transport framing is out of scope; `forward` hands opaque request bytes
/// to whatever carries them to the leader.
pub trait ClusterCoordinator: Send + Sync {
    /// Stable identity of this node.
    fn node_id(&self) -> &str;

    fn is_leader(&self) -> impl Future<Output = bool> + Send;

    fn leader_endpoint(&self) -> impl Future<Output = Option<String>> + Send;

    /// Run `work` only when this node currently leads; otherwise resolve to
    /// a `NotLeader` failure without invoking it.
    fn execute_if_leader<F, Fut, T>(&self, work: F) -> impl Future<Output = CvResult<T>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CvResult<T>> + Send,
        T: Send;

    /// Proxy serialized request bytes to the current leader and return the
    /// serialized response.
    fn forward(
        &self,
        message_type: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = CvResult<Vec<u8>>> + Send;
}
