//! Retry behavior

use std::time::Duration;

use cv_domain::CvResult;
use futures::future::BoxFuture;
use rand::Rng;
use tracing::debug;

use crate::pipeline::{Behavior, BehaviorMessage, BehaviorResponse, Next};

/// Attempt budget and backoff curve for retried dispatches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` failures: exponential with
    /// full jitter, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let capped = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ceiling = (capped.as_millis() as u64).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling))
    }
}

/// Re-invokes the rest of the pipeline on retriable failures.
///
/// Only `Transient` and `RateLimited` kinds retry; a `Conflict` needs the
/// caller to replay its aggregate first and is passed through untouched.
#[derive(Debug, Clone, Default)]
pub struct RetryBehavior {
    policy: RetryPolicy,
}

impl RetryBehavior {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Behavior for RetryBehavior {
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let result = next.run(message).await;
                match result {
                    Err(error)
                        if error.is_retriable()
                            && attempt < self.policy.max_attempts
                            && !message.ctx.is_cancelled() =>
                    {
                        let delay = self.policy.backoff(attempt);
                        debug!(
                            message = message.message_name,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retriable failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    other => return other,
                }
            }
        })
    }
}
