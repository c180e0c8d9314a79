//! Mediator dispatch

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use cv_domain::{CvResult, Event, HandlerFailure, MediatorError, Request};
use tracing::{debug, instrument, warn};

use crate::context::DispatchContext;
use crate::pipeline::{BehaviorMessage, MessageKind, Next};
use crate::registry::{EventPipelineEntry, RegistryBuilder, RequestPipeline};

/// Routes requests to one handler and events to all of theirs, through the
/// behavior pipeline. Holds no per-call state; concurrent dispatches are
/// independent.
pub struct Mediator {
    requests: HashMap<TypeId, RequestPipeline>,
    events: HashMap<TypeId, Vec<EventPipelineEntry>>,
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("requests", &self.requests.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Mediator {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn from_parts(
        requests: HashMap<TypeId, RequestPipeline>,
        events: HashMap<TypeId, Vec<EventPipelineEntry>>,
    ) -> Self {
        Self { requests, events }
    }

    /// Dispatch a request to its single registered handler.
    #[instrument(skip(self, request, ctx), fields(request = %R::name(), message_id = %ctx.message_id))]
    pub async fn send<R>(&self, request: R, ctx: DispatchContext) -> CvResult<R::Response>
    where
        R: Request + Clone,
    {
        if ctx.is_cancelled() {
            return Err(MediatorError::cancelled());
        }

        let pipeline = self
            .requests
            .get(&TypeId::of::<R>())
            .ok_or_else(|| MediatorError::no_handler(R::name()))?;

        let message =
            BehaviorMessage::new(R::name(), MessageKind::Request, ctx, Arc::new(request));
        let response = Next::new(&pipeline.behaviors, &*pipeline.terminal)
            .run(&message)
            .await?;

        response.downcast::<R::Response>().map(|b| *b).map_err(|_| {
            MediatorError::configuration(format!(
                "response type mismatch for {}; a behavior substituted a foreign value",
                R::name()
            ))
        })
    }

    /// Fan an event out to every registered handler, in registration order.
    ///
    /// One handler's failure never cancels the others; failures come back
    /// aggregated with a per-handler breakdown.
    #[instrument(skip(self, event, ctx), fields(event = %E::name(), message_id = %ctx.message_id))]
    pub async fn publish<E>(&self, event: E, ctx: DispatchContext) -> CvResult<()>
    where
        E: Event,
    {
        if ctx.is_cancelled() {
            return Err(MediatorError::cancelled());
        }

        let Some(entries) = self.events.get(&TypeId::of::<E>()) else {
            debug!("no handlers registered, publish is a no-op");
            return Ok(());
        };

        let payload: Arc<dyn std::any::Any + Send + Sync> = Arc::new(event);
        let mut failures = Vec::new();

        for entry in entries {
            if ctx.is_cancelled() {
                return Err(MediatorError::cancelled());
            }
            let message = BehaviorMessage::new(
                E::name(),
                MessageKind::Event,
                ctx.clone(),
                Arc::clone(&payload),
            );
            if let Err(error) = Next::new(&entry.behaviors, &*entry.terminal)
                .run(&message)
                .await
            {
                warn!(handler = entry.handler_name, error = %error, "event handler failed");
                failures.push(HandlerFailure {
                    handler: entry.handler_name.to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MediatorError::aggregate(failures))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
