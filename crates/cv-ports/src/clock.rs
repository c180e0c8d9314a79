//! Clock port for deterministic time handling

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
///
/// Object-safe on purpose so ttl-bearing stores can hold `Arc<dyn Clock>`
/// and tests can substitute a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
