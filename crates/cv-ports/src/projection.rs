//! Projection port

use cv_domain::EventEnvelope;

/// Projection errors
#[derive(Debug, thiserror::Error)]
pub enum ProjectionApplyError {
    #[error("projection {projection} failed to apply {event_type}: {message}")]
    Apply {
        projection: String,
        event_type: String,
        message: String,
    },
}

/// A read model built by folding events.
///
/// `apply` is serialized per projection instance by the runtime; `reset`
/// returns the model to its empty state ahead of a rebuild.
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// Stream pattern this projection consumes, `*` for everything.
    fn stream_pattern(&self) -> &str {
        "*"
    }

    fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), ProjectionApplyError>;

    fn reset(&mut self);
}
