//! Dispatch context

use chrono::{DateTime, Utc};
use cv_domain::MessageId;
use cv_ports::CancellationToken;

/// Ambient context travelling with one dispatch.
///
/// Carries the message identity, optional correlation, the cooperative
/// cancellation token, and an optional deadline. The mediator holds no other
/// per-call state.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub message_id: MessageId,
    pub correlation_id: Option<String>,
    pub cancellation: CancellationToken,
    pub deadline: Option<DateTime<Utc>>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self {
            message_id: MessageId::next(),
            correlation_id: None,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Context for a follow-up message caused by this one: fresh id, same
    /// correlation chain, child cancellation scope.
    pub fn derive(&self) -> Self {
        Self {
            message_id: MessageId::next(),
            correlation_id: self
                .correlation_id
                .clone()
                .or_else(|| Some(self.message_id.to_string())),
            cancellation: self.cancellation.child(),
            deadline: self.deadline,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Utc::now() >= deadline)
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_keeps_correlation_and_scopes_cancellation() {
        let parent = DispatchContext::new().with_correlation_id("corr-1");
        let child = parent.derive();

        assert_ne!(parent.message_id, child.message_id);
        assert_eq!(child.correlation_id.as_deref(), Some("corr-1"));

        parent.cancellation.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn derive_starts_a_correlation_chain() {
        let parent = DispatchContext::new();
        let child = parent.derive();
        assert_eq!(
            child.correlation_id.as_deref(),
            Some(parent.message_id.to_string().as_str())
        );
    }

    #[test]
    fn past_deadline_counts_as_cancelled() {
        let ctx = DispatchContext::new().with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert!(ctx.is_cancelled());
    }
}
