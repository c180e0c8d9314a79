//! PostgreSQL adapter implementations
//!
//! Durable event store with append-only streams, optimistic concurrency, and
//! a transactional outbox: event rows and outbox rows commit together, which
//! is what makes external publication at-least-once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cv_domain::{EventData, EventEnvelope, EventId, EventStream, OutboxMessage};
use cv_ports::{
    validate_stream_id, EventStore, EventStoreError, ExpectedVersion, OutboxError, OutboxStore,
};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, error, instrument};

const MIGRATIONS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS cv",
    r#"
    CREATE TABLE IF NOT EXISTS cv.streams (
        stream_id      TEXT PRIMARY KEY,
        stream_version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cv.events (
        global_seq    BIGSERIAL PRIMARY KEY,
        event_id      TEXT NOT NULL UNIQUE,
        stream_id     TEXT NOT NULL,
        version       BIGINT NOT NULL,
        event_type    TEXT NOT NULL,
        occurred_at   TIMESTAMPTZ NOT NULL,
        payload       JSONB NOT NULL,
        metadata      JSONB,
        envelope_hash TEXT NOT NULL,
        UNIQUE (stream_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cv.outbox (
        id           TEXT PRIMARY KEY,
        message_type TEXT NOT NULL,
        payload      BYTEA NOT NULL,
        stream_id    TEXT,
        created_at   TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        attempts     INT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_cv_outbox_pending
        ON cv.outbox (created_at) WHERE processed_at IS NULL
    "#,
];

fn storage_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::StorageUnavailable {
        message: e.to_string(),
    }
}

/// Translate a `*` wildcard pattern into a SQL LIKE pattern.
fn like_pattern(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(c);
            }
            c => like.push(c),
        }
    }
    like
}

fn row_to_envelope(row: &PgRow) -> Result<EventEnvelope, EventStoreError> {
    let metadata: Option<serde_json::Value> = row.try_get("metadata").map_err(storage_error)?;
    let metadata: BTreeMap<String, String> = match metadata {
        Some(value) => {
            serde_json::from_value(value).map_err(|e| EventStoreError::StorageCorruption {
                message: format!("undecodable event metadata: {e}"),
            })?
        }
        None => BTreeMap::new(),
    };

    Ok(EventEnvelope {
        event_id: EventId::from_string(row.try_get("event_id").map_err(storage_error)?),
        stream_id: row.try_get("stream_id").map_err(storage_error)?,
        version: row.try_get::<i64, _>("version").map_err(storage_error)? as u64,
        global_seq: Some(row.try_get::<i64, _>("global_seq").map_err(storage_error)? as u64),
        event_type: row.try_get("event_type").map_err(storage_error)?,
        occurred_at: row.try_get("occurred_at").map_err(storage_error)?,
        payload: row.try_get("payload").map_err(storage_error)?,
        metadata,
        envelope_hash: row.try_get("envelope_hash").map_err(storage_error)?,
    })
}

/// PostgreSQL-backed event store.
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPool::connect(database_url).await.map_err(storage_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema and tables when missing.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }
        Ok(())
    }

    /// Lock the stream header row and return the current version, creating
    /// the header when the stream is new.
    async fn lock_stream(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        stream_id: &str,
    ) -> Result<u64, EventStoreError> {
        let row =
            sqlx::query("SELECT stream_version FROM cv.streams WHERE stream_id = $1 FOR UPDATE")
                .bind(stream_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(storage_error)?;

        match row {
            Some(row) => Ok(row.get::<i64, _>("stream_version") as u64),
            None => {
                sqlx::query(
                    "INSERT INTO cv.streams (stream_id, stream_version) VALUES ($1, 0)",
                )
                .bind(stream_id)
                .execute(&mut **tx)
                .await
                .map_err(storage_error)?;
                Ok(0)
            }
        }
    }

    async fn insert_events(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        stream_id: &str,
        current_version: u64,
        events: Vec<EventData>,
    ) -> Result<(u64, Vec<EventEnvelope>), EventStoreError> {
        let occurred_at = Utc::now();
        let mut version = current_version;
        let mut envelopes = Vec::with_capacity(events.len());

        for data in events {
            version += 1;
            let mut envelope = EventEnvelope::seal(stream_id, version, data, occurred_at);
            let metadata = if envelope.metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_value(&envelope.metadata).map_err(|e| {
                    EventStoreError::SerializationError {
                        message: e.to_string(),
                    }
                })?)
            };

            let global_seq: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO cv.events (
                    event_id, stream_id, version, event_type,
                    occurred_at, payload, metadata, envelope_hash
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING global_seq
                "#,
            )
            .bind(envelope.event_id.as_str())
            .bind(stream_id)
            .bind(version as i64)
            .bind(&envelope.event_type)
            .bind(envelope.occurred_at)
            .bind(&envelope.payload)
            .bind(&metadata)
            .bind(&envelope.envelope_hash)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                error!(error = %e, stream_id = stream_id, "failed to insert event");
                storage_error(e)
            })?;

            envelope.global_seq = Some(global_seq as u64);
            envelopes.push(envelope);
        }

        sqlx::query("UPDATE cv.streams SET stream_version = $1 WHERE stream_id = $2")
            .bind(version as i64)
            .bind(stream_id)
            .execute(&mut **tx)
            .await
            .map_err(storage_error)?;

        Ok((version, envelopes))
    }

    fn check_expected(
        stream_id: &str,
        current: u64,
        expected: ExpectedVersion,
    ) -> Result<(), EventStoreError> {
        if let ExpectedVersion::Exact(expected) = expected {
            if current != expected {
                debug!(
                    stream_id = stream_id,
                    expected = expected,
                    actual = current,
                    "concurrency conflict detected"
                );
                return Err(EventStoreError::ConcurrencyConflict {
                    expected,
                    actual: current,
                });
            }
        }
        Ok(())
    }

    /// Append events and stage one outbox row per envelope in a single
    /// transaction.
    #[instrument(skip(self, events), fields(stream_id = %stream_id, event_count = events.len()))]
    pub async fn append_with_outbox(
        &self,
        stream_id: &str,
        events: Vec<EventData>,
        expected_version: ExpectedVersion,
    ) -> Result<u64, EventStoreError> {
        validate_stream_id(stream_id)?;

        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let current = Self::lock_stream(&mut tx, stream_id).await?;
        Self::check_expected(stream_id, current, expected_version)?;
        if events.is_empty() {
            return Ok(current);
        }

        let (new_version, envelopes) =
            Self::insert_events(&mut tx, stream_id, current, events).await?;

        for envelope in &envelopes {
            let payload =
                serde_json::to_vec(envelope).map_err(|e| EventStoreError::SerializationError {
                    message: e.to_string(),
                })?;
            let message = OutboxMessage::new(
                envelope.event_type.clone(),
                payload,
                envelope.occurred_at,
            )
            .for_stream(stream_id);

            sqlx::query(
                r#"
                INSERT INTO cv.outbox (id, message_type, payload, stream_id, created_at, attempts)
                VALUES ($1, $2, $3, $4, $5, 0)
                "#,
            )
            .bind(&message.id)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(&message.stream_id)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        tx.commit().await.map_err(storage_error)?;
        Ok(new_version)
    }
}

impl EventStore for PostgresEventStore {
    #[instrument(skip(self, events), fields(stream_id = %stream_id, event_count = events.len()))]
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventData>,
        expected_version: ExpectedVersion,
    ) -> Result<u64, EventStoreError> {
        validate_stream_id(stream_id)?;

        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let current = Self::lock_stream(&mut tx, stream_id).await?;
        Self::check_expected(stream_id, current, expected_version)?;
        if events.is_empty() {
            return Ok(current);
        }

        let (new_version, _) = Self::insert_events(&mut tx, stream_id, current, events).await?;
        tx.commit().await.map_err(storage_error)?;
        Ok(new_version)
    }

    async fn read(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: usize,
    ) -> Result<EventStream, EventStoreError> {
        validate_stream_id(stream_id)?;

        let version = self.stream_version(stream_id).await?;
        if version == 0 {
            return Ok(EventStream::empty(stream_id));
        }

        let limit = max_count.min(i64::MAX as usize) as i64;
        let rows = sqlx::query(
            r#"
            SELECT global_seq, event_id, stream_id, version, event_type,
                   occurred_at, payload, metadata, envelope_hash
            FROM cv.events
            WHERE stream_id = $1 AND version >= $2
            ORDER BY version ASC
            LIMIT $3
            "#,
        )
        .bind(stream_id)
        .bind(from_version.max(1) as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let events = rows
            .iter()
            .map(row_to_envelope)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventStream {
            stream_id: stream_id.to_string(),
            version,
            events,
        })
    }

    async fn stream_exists(&self, stream_id: &str) -> Result<bool, EventStoreError> {
        Ok(self.stream_version(stream_id).await? > 0)
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        validate_stream_id(stream_id)?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT stream_version FROM cv.streams WHERE stream_id = $1")
                .bind(stream_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(version.unwrap_or(0) as u64)
    }

    #[instrument(skip(self))]
    async fn delete_stream(&self, stream_id: &str) -> Result<(), EventStoreError> {
        validate_stream_id(stream_id)?;

        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        sqlx::query("DELETE FROM cv.events WHERE stream_id = $1")
            .bind(stream_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        sqlx::query("DELETE FROM cv.streams WHERE stream_id = $1")
            .bind(stream_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }

    async fn list_streams(&self, pattern: &str) -> Result<Vec<String>, EventStoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT stream_id FROM cv.streams
            WHERE stream_id LIKE $1 ESCAPE '\' AND stream_version > 0
            ORDER BY stream_id ASC
            "#,
        )
        .bind(like_pattern(pattern))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(rows)
    }

    async fn replay_all(
        &self,
        from_global_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query(
            r#"
            SELECT global_seq, event_id, stream_id, version, event_type,
                   occurred_at, payload, metadata, envelope_hash
            FROM cv.events
            WHERE global_seq > $1
            ORDER BY global_seq ASC
            LIMIT $2
            "#,
        )
        .bind(from_global_seq as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(row_to_envelope).collect()
    }
}

/// PostgreSQL-backed outbox store.
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn outbox_storage_error(e: sqlx::Error) -> OutboxError {
    OutboxError::StorageUnavailable {
        message: e.to_string(),
    }
}

fn row_to_outbox_message(row: &PgRow) -> Result<OutboxMessage, OutboxError> {
    Ok(OutboxMessage {
        id: row.try_get("id").map_err(outbox_storage_error)?,
        message_type: row.try_get("message_type").map_err(outbox_storage_error)?,
        payload: row.try_get("payload").map_err(outbox_storage_error)?,
        stream_id: row.try_get("stream_id").map_err(outbox_storage_error)?,
        created_at: row.try_get("created_at").map_err(outbox_storage_error)?,
        processed_at: row.try_get("processed_at").map_err(outbox_storage_error)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(outbox_storage_error)? as u32,
    })
}

impl OutboxStore for PostgresOutboxStore {
    async fn add(&self, message: OutboxMessage) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO cv.outbox (id, message_type, payload, stream_id, created_at, processed_at, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&message.id)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(&message.stream_id)
        .bind(message.created_at)
        .bind(message.processed_at)
        .bind(message.attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(outbox_storage_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query(
            r#"
            SELECT id, message_type, payload, stream_id, created_at, processed_at, attempts
            FROM cv.outbox
            WHERE processed_at IS NULL
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(outbox_storage_error)?;

        rows.iter().map(row_to_outbox_message).collect()
    }

    async fn mark_processed(&self, id: &str) -> Result<(), OutboxError> {
        sqlx::query(
            "UPDATE cv.outbox SET processed_at = NOW() WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(outbox_storage_error)?;
        Ok(())
    }

    async fn record_attempt(&self, id: &str) -> Result<u32, OutboxError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE cv.outbox SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(outbox_storage_error)?;

        attempts
            .map(|a| a as u32)
            .ok_or_else(|| OutboxError::MessageNotFound { id: id.to_string() })
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result =
            sqlx::query("DELETE FROM cv.outbox WHERE processed_at IS NOT NULL AND processed_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(outbox_storage_error)?;
        Ok(result.rows_affected() as usize)
    }
}

// ============================================================================
// Tests
// ============================================================================
