//! Message identity and the request/event traits

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Process-monotonic, timestamp-sortable message identifier.
///
/// Layout: upper 48 bits are milliseconds since the Unix epoch, lower 16 bits
/// are a monotonic tiebreaker. Two ids generated by the same process never
/// collide and never go backwards, even within one millisecond.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MessageId(u64);

/// Last id handed out by [`MessageId::next`].
static LAST_ISSUED: AtomicU64 = AtomicU64::new(0);

const TIMESTAMP_SHIFT: u32 = 16;

impl MessageId {
    /// Generate the next unique id for this process.
    pub fn next() -> Self {
        let candidate = (Utc::now().timestamp_millis() as u64) << TIMESTAMP_SHIFT;
        let mut last = LAST_ISSUED.load(Ordering::Relaxed);
        loop {
            let id = candidate.max(last + 1);
            match LAST_ISSUED.compare_exchange_weak(last, id, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Self(id),
                Err(observed) => last = observed,
            }
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds since the Unix epoch at which this id was minted.
    pub fn timestamp_millis(&self) -> i64 {
        (self.0 >> TIMESTAMP_SHIFT) as i64
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A piece of domain data routed through the mediator.
///
/// Each message carries a stable name used for wire records, registry
/// diagnostics, and logs. The name should be unique within the domain,
/// e.g. `"CreateOrderCommand"` or `"OrderCreatedEvent"`.
pub trait Message: Send + Sync + 'static {
    /// Stable domain name of this message type.
    fn name() -> &'static str
    where
        Self: Sized;
}

/// A request routed to exactly one handler, producing a typed response.
///
/// Use `Response = ()` for fire-and-forget commands.
pub trait Request: Message {
    type Response: Send + Sync + 'static;
}

/// An event fanned out to zero or more handlers; no response.
pub trait Event: Message + Clone {}
