//! Append + outbox unit of work
//!
//! The durable backends commit the event rows and the outbox rows in one
//! transaction. The in-memory composition keeps the same call shape and
//! ordering: events first, then their outbox rows, so a crash in between
//! re-stages at worst, never loses.

use cv_domain::{CvResult, EventData, MediatorError, OutboxMessage};
use cv_ports::{EventStore, ExpectedVersion, OutboxStore};
use tracing::instrument;

/// Append events and stage one outbox row per appended envelope.
///
/// Returns the new stream version. Outbox payloads are the serialized
/// envelopes, so a dispatcher has the full identity (event id, version,
/// hash) for downstream dedup.
#[instrument(skip(event_store, outbox, events), fields(stream_id = %stream_id, event_count = events.len()))]
pub async fn append_with_outbox<ES, OS>(
    event_store: &ES,
    outbox: &OS,
    stream_id: &str,
    events: Vec<EventData>,
    expected_version: ExpectedVersion,
) -> CvResult<u64>
where
    ES: EventStore,
    OS: OutboxStore,
{
    let count = events.len() as u64;
    let new_version = event_store
        .append(stream_id, events, expected_version)
        .await?;
    if count == 0 {
        return Ok(new_version);
    }

    let appended = event_store
        .read(stream_id, new_version - count + 1, count as usize)
        .await?;
    for envelope in appended.events {
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| MediatorError::fatal(format!("unencodable envelope: {e}")))?;
        let message = OutboxMessage::new(envelope.event_type.clone(), payload, envelope.occurred_at)
            .for_stream(stream_id);
        outbox.add(message).await?;
    }

    Ok(new_version)
}
