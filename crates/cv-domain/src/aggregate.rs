//! Aggregates rebuilt by folding their event history

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::EventEnvelope;
use crate::error::{CvResult, MediatorError};

/// A domain entity whose history is an event stream.
///
/// The event type is usually an `enum` covering everything that can happen
/// to the entity. `apply` is the only way state changes.
pub trait Aggregate: Sized + Send + Sync {
    /// Domain events that interest this aggregate.
    type Event: Serialize + DeserializeOwned + Send + Sync;

    /// Unique name for this aggregate type, used as the stream id prefix.
    fn type_name() -> &'static str;

    /// Identifier of this aggregate instance.
    fn aggregate_id(&self) -> &str;

    /// Stable wire tag for one of this aggregate's events, e.g.
    /// `"OrderCreatedEvent"`.
    fn event_type(event: &Self::Event) -> &'static str;

    /// Mutate state through a domain event.
    ///
    /// `state` is `None` when the event is the first in the stream. Returns
    /// an error when the event is unexpected for the current state.
    fn apply(state: Option<Self>, event: Self::Event) -> CvResult<Self>;

    /// Stream id for an aggregate instance, e.g. `Order-42`.
    fn stream_id(id: &str) -> String {
        format!("{}-{}", Self::type_name(), id)
    }
}

/// Rebuild an aggregate by folding persisted envelopes in version order.
///
/// Returns `Ok(None)` for an empty history. Payloads that fail to decode
/// surface as `Fatal`: a stream that can no longer be replayed is corrupt.
pub fn fold<A: Aggregate>(envelopes: &[EventEnvelope]) -> CvResult<Option<A>> {
    fold_from(None, envelopes)
}

/// Continue a fold from snapshot state.
pub fn fold_from<A: Aggregate>(
    initial: Option<A>,
    envelopes: &[EventEnvelope],
) -> CvResult<Option<A>> {
    let mut state = initial;
    for envelope in envelopes {
        let event: A::Event = envelope.payload_as().map_err(|e| {
            MediatorError::fatal(format!(
                "undecodable event {} at {}@{}: {e}",
                envelope.event_type, envelope.stream_id, envelope.version
            ))
        })?;
        state = Some(A::apply(state, event)?);
    }
    Ok(state)
}
