//! Logging behavior

use cv_domain::CvResult;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::pipeline::{Behavior, BehaviorMessage, BehaviorResponse, Next};

/// Logs each dispatch with its outcome and latency.
///
/// Registered first, so it observes the full pipeline cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

impl Behavior for LoggingBehavior {
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        Box::pin(async move {
            let started = std::time::Instant::now();
            debug!(
                message = message.message_name,
                message_id = %message.ctx.message_id,
                kind = ?message.kind,
                "dispatching"
            );

            let result = next.run(message).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => debug!(
                    message = message.message_name,
                    message_id = %message.ctx.message_id,
                    elapsed_ms = elapsed_ms,
                    "dispatch succeeded"
                ),
                Err(error) => warn!(
                    message = message.message_name,
                    message_id = %message.ctx.message_id,
                    elapsed_ms = elapsed_ms,
                    kind = ?error.kind,
                    error = %error,
                    "dispatch failed"
                ),
            }
            result
        })
    }
}
