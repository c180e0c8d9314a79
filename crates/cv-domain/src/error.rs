//! Result taxonomy shared by every public Convoy entrypoint
//!
//! No exceptions cross the mediator boundary: handlers, behaviors, and stores
//! all surface failures as [`MediatorError`] values. Panics are caught at the
//! pipeline boundary and lifted into the `Fatal` kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the mediator, stores, and flow engine.
pub type CvResult<T> = Result<T, MediatorError>;

/// Classification of a failure, driving retry and surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Input predicate failed; user-surfaced, never retried.
    Validation,
    /// Missing aggregate, stream, or resource.
    NotFound,
    /// Optimistic concurrency conflict; caller may replay and retry.
    Conflict,
    /// Policy denial by identity.
    Unauthorized,
    /// Policy denial by role or scope.
    Forbidden,
    /// I/O, timeout, or transport failure; retried with backoff.
    Transient,
    /// Deferred by a rate limit; retry after the window.
    RateLimited,
    /// This node is not the cluster leader for a leader-only operation.
    NotLeader,
    /// No handler registered for the request type.
    NoHandler,
    /// Registration missing or ambiguous.
    ConfigurationError,
    /// Dispatch observed the ambient cancellation signal.
    Cancelled,
    /// One or more event handlers failed during a publish.
    AggregateEventFailure,
    /// Corruption or invariant violation; operator intervention required.
    Fatal,
}

/// One handler's failure inside an aggregated publish result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: MediatorError,
}

/// The single error type crossing the mediator boundary.
///
/// Behaviors may convert kinds but must preserve the cause chain, which is
/// why `cause` nests another `MediatorError` rather than a bare string.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct MediatorError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<Box<MediatorError>>,
    /// Per-handler breakdown, populated only for `AggregateEventFailure`.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub handler_failures: Vec<HandlerFailure>,
}

impl MediatorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            handler_failures: Vec::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(current: u64, expected: u64) -> Self {
        Self::new(
            ErrorKind::Conflict,
            format!("version conflict: current {current}, expected {expected}"),
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn rate_limited(key: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            format!("rate limit reached for key {}", key.into()),
        )
    }

    pub fn not_leader(leader_endpoint: Option<&str>) -> Self {
        Self::new(
            ErrorKind::NotLeader,
            match leader_endpoint {
                Some(endpoint) => format!("not the cluster leader, leader is {endpoint}"),
                None => "not the cluster leader, no leader known".to_string(),
            },
        )
    }

    pub fn no_handler(message_name: &str) -> Self {
        Self::new(
            ErrorKind::NoHandler,
            format!("no handler registered for {message_name}"),
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "dispatch cancelled")
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Aggregate per-handler failures from an event publish.
    pub fn aggregate(failures: Vec<HandlerFailure>) -> Self {
        let mut err = Self::new(
            ErrorKind::AggregateEventFailure,
            format!("{} event handler(s) failed", failures.len()),
        );
        err.handler_failures = failures;
        err
    }

    /// Attach an underlying cause, preserving its own chain.
    pub fn with_cause(mut self, cause: MediatorError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Re-classify this error while keeping it as the cause of the new one.
    pub fn into_kind(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        MediatorError::new(kind, message).with_cause(self)
    }

    /// Whether a retry behavior may re-dispatch without caller involvement.
    ///
    /// `Conflict` is deliberately excluded: the caller must replay the
    /// aggregate before retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::RateLimited)
    }

    /// Innermost error in the cause chain.
    pub fn root_cause(&self) -> &MediatorError {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_chain_is_preserved_through_conversion() {
        let inner = MediatorError::transient("socket reset");
        let outer = inner.into_kind(ErrorKind::Fatal, "retries exhausted");

        assert_eq!(outer.kind, ErrorKind::Fatal);
        assert_eq!(outer.root_cause().kind, ErrorKind::Transient);
        assert_eq!(outer.root_cause().message, "socket reset");
    }

    #[test]
    fn retriable_kinds() {
        assert!(MediatorError::transient("io").is_retriable());
        assert!(MediatorError::rate_limited("k").is_retriable());
        assert!(!MediatorError::conflict(1, 0).is_retriable());
        assert!(!MediatorError::validation("bad").is_retriable());
    }

    #[test]
    fn aggregate_keeps_per_handler_breakdown() {
        let err = MediatorError::aggregate(vec![
            HandlerFailure {
                handler: "audit".into(),
                error: MediatorError::transient("down"),
            },
            HandlerFailure {
                handler: "billing".into(),
                error: MediatorError::validation("negative amount"),
            },
        ]);

        assert_eq!(err.kind, ErrorKind::AggregateEventFailure);
        assert_eq!(err.handler_failures.len(), 2);
        assert_eq!(err.handler_failures[1].handler, "billing");
    }

    #[test]
    fn round_trips_through_json() {
        let err = MediatorError::conflict(3, 2).into_kind(ErrorKind::Fatal, "gave up");
        let json = serde_json::to_string(&err).unwrap();
        let back: MediatorError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::Fatal);
        assert_eq!(back.root_cause().kind, ErrorKind::Conflict);
    }
}
