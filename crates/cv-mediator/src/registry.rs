//! Handler registry
//!
//! Built eagerly at startup and finalized before the first dispatch; the
//! registry is owned by the mediator instance, never process-global, so
//! tests can wire independent registries side by side. Lookup is O(1) by
//! type identity.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use cv_domain::{CvResult, Event, MediatorError, Message, Request};

use crate::handler::{EventHandler, RequestHandler};
use crate::mediator::Mediator;
use crate::pipeline::{catch_handler_panics, Behavior, BehaviorResponse, TerminalHandler};

pub(crate) struct RequestPipeline {
    pub(crate) behaviors: Vec<Arc<dyn Behavior>>,
    pub(crate) terminal: Box<TerminalHandler>,
}

pub(crate) struct EventPipelineEntry {
    pub(crate) handler_name: &'static str,
    pub(crate) behaviors: Vec<Arc<dyn Behavior>>,
    pub(crate) terminal: Box<TerminalHandler>,
}

/// Builder collecting handlers and behaviors ahead of the first dispatch.
///
/// Behaviors apply in registration order, outermost first; global behaviors
/// wrap before per-message-type ones. Registering two handlers for the same
/// request type is a configuration error surfaced by `build`.
#[derive(Default)]
pub struct RegistryBuilder {
    global_behaviors: Vec<Arc<dyn Behavior>>,
    scoped_behaviors: HashMap<TypeId, Vec<Arc<dyn Behavior>>>,
    request_terminals: HashMap<TypeId, Box<TerminalHandler>>,
    event_terminals: HashMap<TypeId, Vec<(&'static str, Box<TerminalHandler>)>>,
    duplicate_requests: Vec<&'static str>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for a request type.
    pub fn register_request_handler<R, H>(mut self, handler: H) -> Self
    where
        R: Request + Clone,
        H: RequestHandler<R>,
    {
        let type_id = TypeId::of::<R>();
        if self.request_terminals.contains_key(&type_id) {
            self.duplicate_requests.push(R::name());
            return self;
        }
        self.request_terminals
            .insert(type_id, request_terminal::<R, H>(Arc::new(handler)));
        self
    }

    /// Register one of possibly many handlers for an event type. Invocation
    /// order at publish is this registration order.
    pub fn register_event_handler<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let handler = Arc::new(handler);
        let handler_name = handler.name();
        self.event_terminals
            .entry(TypeId::of::<E>())
            .or_default()
            .push((handler_name, event_terminal::<E, H>(handler)));
        self
    }

    /// Register a behavior wrapping every dispatch.
    pub fn register_behavior(mut self, behavior: impl Behavior) -> Self {
        self.global_behaviors.push(Arc::new(behavior));
        self
    }

    /// Register a behavior wrapping dispatches of one message type only.
    pub fn register_behavior_for<M: Message>(mut self, behavior: impl Behavior) -> Self {
        self.scoped_behaviors
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(behavior));
        self
    }

    /// Finalize the registry. No mutation is supported afterwards.
    pub fn build(mut self) -> CvResult<Mediator> {
        if !self.duplicate_requests.is_empty() {
            return Err(MediatorError::configuration(format!(
                "multiple handlers registered for request type(s): {}",
                self.duplicate_requests.join(", ")
            )));
        }

        let mut requests = HashMap::with_capacity(self.request_terminals.len());
        for (type_id, terminal) in self.request_terminals {
            requests.insert(
                type_id,
                RequestPipeline {
                    behaviors: chain_for(
                        &self.global_behaviors,
                        self.scoped_behaviors.get(&type_id),
                    ),
                    terminal,
                },
            );
        }

        let mut events = HashMap::with_capacity(self.event_terminals.len());
        for (type_id, terminals) in self.event_terminals {
            let scoped = self.scoped_behaviors.remove(&type_id);
            let entries = terminals
                .into_iter()
                .map(|(handler_name, terminal)| EventPipelineEntry {
                    handler_name,
                    behaviors: chain_for(&self.global_behaviors, scoped.as_ref()),
                    terminal,
                })
                .collect();
            events.insert(type_id, entries);
        }

        Ok(Mediator::from_parts(requests, events))
    }
}

fn chain_for(
    global: &[Arc<dyn Behavior>],
    scoped: Option<&Vec<Arc<dyn Behavior>>>,
) -> Vec<Arc<dyn Behavior>> {
    let mut chain = Vec::with_capacity(global.len() + scoped.map(|s| s.len()).unwrap_or(0));
    chain.extend(global.iter().cloned());
    if let Some(scoped) = scoped {
        chain.extend(scoped.iter().cloned());
    }
    chain
}

fn request_terminal<R, H>(handler: Arc<H>) -> Box<TerminalHandler>
where
    R: Request + Clone,
    H: RequestHandler<R>,
{
    Box::new(move |message| {
        let request = message.downcast_ref::<R>().cloned();
        let ctx = message.ctx.clone();
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let Some(request) = request else {
                return Err(MediatorError::fatal(format!(
                    "payload type mismatch dispatching {}",
                    R::name()
                )));
            };
            catch_handler_panics(async move {
                handler
                    .handle(request, &ctx)
                    .await
                    .map(|response| Box::new(response) as BehaviorResponse)
            })
            .await
        })
    })
}

fn event_terminal<E, H>(handler: Arc<H>) -> Box<TerminalHandler>
where
    E: Event,
    H: EventHandler<E>,
{
    Box::new(move |message| {
        let event = message.downcast_ref::<E>().cloned();
        let ctx = message.ctx.clone();
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let Some(event) = event else {
                return Err(MediatorError::fatal(format!(
                    "payload type mismatch dispatching {}",
                    E::name()
                )));
            };
            catch_handler_panics(async move {
                handler
                    .handle(event, &ctx)
                    .await
                    .map(|()| Box::new(()) as BehaviorResponse)
            })
            .await
        })
    })
}
