//! Inbox deduplication behavior

use std::sync::Arc;
use std::time::Duration;

use cv_domain::{CvResult, ErrorKind, MediatorError};
use cv_ports::InboxStore;
use futures::future::BoxFuture;
use tracing::debug;

use crate::pipeline::{Behavior, BehaviorMessage, BehaviorResponse, MessageKind, Next};

/// Exactly-once-effect guard over the message id.
///
/// The first delivery of an id runs the handler; duplicates inside the ttl
/// skip it. A duplicate event resolves `Ok` (the effect already happened); a
/// duplicate request is rejected, because its typed response cannot be
/// fabricated here. Pair request dedup with an `IdempotencyStore` in the
/// handler when the cached response matters.
pub struct InboxBehavior<S> {
    inbox: Arc<S>,
    ttl: Duration,
}

impl<S> InboxBehavior<S> {
    pub fn new(inbox: Arc<S>, ttl: Duration) -> Self {
        Self { inbox, ttl }
    }
}

impl<S> Behavior for InboxBehavior<S>
where
    S: InboxStore + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        Box::pin(async move {
            let first_delivery = self
                .inbox
                .try_store(message.ctx.message_id, self.ttl)
                .await?;
            if first_delivery {
                return next.run(message).await;
            }

            debug!(
                message = message.message_name,
                message_id = %message.ctx.message_id,
                "duplicate delivery suppressed"
            );
            match message.kind {
                MessageKind::Event => Ok(Box::new(()) as BehaviorResponse),
                MessageKind::Request => Err(MediatorError::new(
                    ErrorKind::Validation,
                    format!(
                        "duplicate delivery of request {} ({})",
                        message.message_name, message.ctx.message_id
                    ),
                )),
            }
        })
    }
}
