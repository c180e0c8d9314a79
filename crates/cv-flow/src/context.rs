//! Flow execution context

use std::sync::Arc;

use cv_mediator::{DispatchContext, Mediator};
use cv_ports::CancellationToken;

/// Ambient services handed to every node body.
///
/// Cheap to clone; parallel loop bodies and branches receive their own copy
/// with a child cancellation scope.
#[derive(Clone)]
pub struct FlowContext {
    pub flow_id: String,
    pub mediator: Option<Arc<Mediator>>,
    pub cancellation: CancellationToken,
    pub correlation_id: Option<String>,
}

impl FlowContext {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            mediator: None,
            cancellation: CancellationToken::new(),
            correlation_id: None,
        }
    }

    pub fn with_mediator(mut self, mediator: Arc<Mediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Context for a concurrent child (loop item or branch): same services,
    /// child cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            flow_id: self.flow_id.clone(),
            mediator: self.mediator.clone(),
            cancellation: self.cancellation.child(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Dispatch context for a mediator call made from this flow.
    pub fn dispatch_context(&self) -> DispatchContext {
        let ctx = DispatchContext::new().with_cancellation(self.cancellation.child());
        match &self.correlation_id {
            Some(correlation_id) => ctx.with_correlation_id(correlation_id.clone()),
            None => ctx.with_correlation_id(self.flow_id.clone()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
