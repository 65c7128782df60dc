//! Postgres-backed event store implementation.
//!
//! Persists every organization's log in one `inventory_events` table. Sequence
//! numbers are allocated inside the appending transaction and guarded by a
//! unique `(organization_id, sequence_number)` constraint.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent append took the same sequence number |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` | Invalid data (e.g. `sequence_number <= 0`) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Runtime
//!
//! The `EventStore` trait is synchronous so the fold stays synchronously
//! testable. This store owns a small tokio runtime and blocks on it; call it
//! from plain threads, not from inside another async runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{Span, instrument};

use essentials_core::{EventId, ExpectedVersion, OrganizationId};

use super::r#trait::{
    EventFilter, EventStore, EventStoreError, SnapshotFilter, StoredEvent, UncommittedEvent, batch_organization,
    snapshot_event_type,
};

/// DDL for the event table. Applied by [`PostgresEventStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS inventory_events (
    event_id        UUID PRIMARY KEY,
    organization_id UUID        NOT NULL,
    sequence_number BIGINT      NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT        NOT NULL,
    event_version   INTEGER     NOT NULL,
    event_time      TIMESTAMPTZ NOT NULL,
    payload         JSONB       NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (organization_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS inventory_events_fold_order
    ON inventory_events (organization_id, event_time, sequence_number);
"#;

/// Postgres-backed append-only event store.
///
/// ## Organization Isolation
///
/// Every query filters on `organization_id`, so one organization's log can
/// never be read or extended through another's.
///
/// ## Optimistic Concurrency
///
/// `append()` reads `MAX(sequence_number)` inside a transaction, checks it
/// against `ExpectedVersion`, then inserts. If another writer commits in
/// between, the unique constraint rejects the insert and the append fails with
/// `Concurrency`, leaving nothing behind.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresEventStore {
    /// Connect to `database_url` with a private runtime.
    pub fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EventStoreError::Storage(format!("failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(5).connect(database_url))
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::with_pool(pool, Arc::new(runtime)))
    }

    pub fn with_pool(pool: PgPool, runtime: Arc<Runtime>) -> Self {
        Self { pool, runtime }
    }

    /// Create the table and index when missing.
    pub fn ensure_schema(&self) -> Result<(), EventStoreError> {
        self.runtime.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }

    #[instrument(
        skip(self, events),
        fields(
            organization_id = %organization_id,
            event_count = events.len(),
            expected_version = ?expected_version,
            committed_events = tracing::field::Empty
        ),
        err
    )]
    async fn append_events(
        &self,
        organization_id: OrganizationId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = head_in_tx(&mut tx, organization_id).await?;
        if let Err(stale) = expected_version.check(current) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(stale.into());
        }

        let mut committed = Vec::with_capacity(events.len());
        let mut next = current + 1;
        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO inventory_events (
                    event_id,
                    organization_id,
                    sequence_number,
                    event_type,
                    event_version,
                    event_time,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING created_at, updated_at
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(organization_id.as_uuid())
            .bind(next as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.event_time)
            .bind(&event.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!("sequence_number {next} already taken"))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let created_at: DateTime<Utc> = row.try_get("created_at").map_err(|e| map_sqlx_error("insert_event", e))?;
            let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(|e| map_sqlx_error("insert_event", e))?;

            committed.push(StoredEvent {
                event_id: event.event_id,
                organization_id,
                sequence_number: next,
                event_type: event.event_type,
                event_version: event.event_version,
                event_time: event.event_time,
                created_at,
                updated_at,
                payload: event.payload,
            });
            next += 1;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", committed.len());
        Ok(committed)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id, event_count = tracing::field::Empty), err)]
    async fn select_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let snapshot_mode: Option<bool> = match filter.snapshots {
            SnapshotFilter::Include => None,
            SnapshotFilter::Exclude => Some(false),
            SnapshotFilter::Only => Some(true),
        };

        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                organization_id,
                sequence_number,
                event_type,
                event_version,
                event_time,
                payload,
                created_at,
                updated_at
            FROM inventory_events
            WHERE organization_id = $1
                AND ($2::boolean IS NULL OR (event_type = $3) = $2)
                AND ($4::timestamptz IS NULL OR event_time > $4)
                AND ($5::timestamptz IS NULL OR event_time <= $5)
                AND ($6::bigint IS NULL OR sequence_number > $6)
                AND ($7::bigint IS NULL OR sequence_number <= $7)
            ORDER BY event_time ASC, sequence_number ASC
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(snapshot_mode)
        .bind(snapshot_event_type())
        .bind(filter.after)
        .bind(filter.until)
        .bind(filter.after_sequence.map(|s| s as i64))
        .bind(filter.through_sequence.map(|s| s as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_events", e))?;

        let events = rows.iter().map(stored_event_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(organization_id) = batch_organization(&events)? else {
            return Ok(vec![]);
        };
        self.runtime
            .block_on(self.append_events(organization_id, events, expected_version))
    }

    fn load_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.runtime.block_on(self.select_events(organization_id, filter))
    }

    fn head_sequence(&self, organization_id: OrganizationId) -> Result<u64, EventStoreError> {
        self.runtime.block_on(async {
            let row = sqlx::query(
                "SELECT COALESCE(MAX(sequence_number), 0) AS head FROM inventory_events WHERE organization_id = $1",
            )
            .bind(organization_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("head_sequence", e))?;
            let head: i64 = row.try_get("head").map_err(|e| map_sqlx_error("head_sequence", e))?;
            Ok(head as u64)
        })
    }
}

async fn head_in_tx(tx: &mut Transaction<'_, Postgres>, organization_id: OrganizationId) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(sequence_number), 0) AS head FROM inventory_events WHERE organization_id = $1",
    )
    .bind(organization_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_head", e))?;

    let head: i64 = row.try_get("head").map_err(|e| map_sqlx_error("check_head", e))?;
    Ok(head as u64)
}

fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let read = |e: sqlx::Error| EventStoreError::Storage(format!("failed to decode event row: {e}"));

    let event_id: uuid::Uuid = row.try_get("event_id").map_err(read)?;
    let organization_id: uuid::Uuid = row.try_get("organization_id").map_err(read)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(read)?;
    let event_version: i32 = row.try_get("event_version").map_err(read)?;

    Ok(StoredEvent {
        event_id: EventId::from_uuid(event_id),
        organization_id: OrganizationId::from_uuid(organization_id),
        sequence_number: sequence_number as u64,
        event_type: row.try_get("event_type").map_err(read)?,
        event_version: event_version as u32,
        event_time: row.try_get("event_time").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
    })
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Storage(format!("connection pool closed in {operation}")),
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_fold_order_and_uniqueness() {
        assert!(SCHEMA.contains("UNIQUE (organization_id, sequence_number)"));
        assert!(SCHEMA.contains("(organization_id, event_time, sequence_number)"));
    }

    #[test]
    fn unique_violation_is_only_database_errors() {
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
        assert!(matches!(
            map_sqlx_error("load_events", sqlx::Error::PoolClosed),
            EventStoreError::Storage(_)
        ));
    }
}
