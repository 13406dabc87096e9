//! `PostgreSQL` WorkItem event log.
//!
//! Records go to `<schema>.work_item_events`, unique on
//! `(aggregate_id, version)`. A duplicate version surfaces as
//! [`EventStoreError::ConcurrencyConflict`]; nothing is retried here.

use crate::Schema;
use futures::future::BoxFuture;
use relayflow_core::event::DomainEvent;
use relayflow_core::event_store::{EventStore, EventStoreError, WorkItemEventRecord};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

/// Event log of one schema.
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
    schema: Schema,
}

impl PostgresEventStore {
    /// Event store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Insert one record on an open connection.
///
/// A unique violation on `(aggregate_id, version)` becomes a conflict.
pub(crate) async fn insert_record(
    conn: &mut PgConnection,
    schema: &Schema,
    record: &WorkItemEventRecord,
) -> Result<(), EventStoreError> {
    sqlx::query(&format!(
        r"
        INSERT INTO {} (aggregate_id, event_type, event_data, version, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ",
        schema.events()
    ))
    .bind(record.aggregate_id)
    .bind(&record.event_type)
    .bind(&record.event_data)
    .bind(record.version)
    .bind(record.created_at)
    .execute(conn)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return EventStoreError::ConcurrencyConflict {
                    aggregate_id: record.aggregate_id,
                    version: record.version,
                };
            }
        }
        EventStoreError::DatabaseError(format!("Failed to append event: {e}"))
    })?;

    Ok(())
}

/// Insert a batch on an open connection, the first at `starting_version`.
pub(crate) async fn insert_records(
    conn: &mut PgConnection,
    schema: &Schema,
    aggregate_id: Uuid,
    events: &[DomainEvent],
    starting_version: i64,
) -> Result<i64, EventStoreError> {
    let mut version = starting_version;
    for event in events {
        let record = WorkItemEventRecord::encode(event, version)?;
        if record.aggregate_id != aggregate_id {
            return Err(EventStoreError::CorruptStream {
                aggregate_id,
                reason: format!("event for {} appended to this stream", record.aggregate_id),
            });
        }
        insert_record(&mut *conn, schema, &record).await?;
        version += 1;
    }
    Ok(version - 1)
}

impl EventStore for PostgresEventStore {
    fn append<'a>(
        &'a self,
        aggregate_id: Uuid,
        event: &'a DomainEvent,
        expected_version: i64,
    ) -> BoxFuture<'a, Result<WorkItemEventRecord, EventStoreError>> {
        Box::pin(async move {
            let record = WorkItemEventRecord::encode(event, expected_version)?;
            if record.aggregate_id != aggregate_id {
                return Err(EventStoreError::CorruptStream {
                    aggregate_id,
                    reason: format!("event for {} appended to this stream", record.aggregate_id),
                });
            }

            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            insert_record(&mut conn, &self.schema, &record).await?;

            tracing::debug!(
                aggregate_id = %aggregate_id,
                version = record.version,
                event_type = %record.event_type,
                "Event appended"
            );

            Ok(record)
        })
    }

    fn append_events<'a>(
        &'a self,
        aggregate_id: Uuid,
        events: &'a [DomainEvent],
        starting_version: i64,
    ) -> BoxFuture<'a, Result<i64, EventStoreError>> {
        Box::pin(async move {
            if events.is_empty() {
                return Ok(starting_version - 1);
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            let last =
                insert_records(&mut tx, &self.schema, aggregate_id, events, starting_version)
                    .await?;
            tx.commit()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            tracing::debug!(
                aggregate_id = %aggregate_id,
                from = starting_version,
                to = last,
                "Events appended"
            );

            Ok(last)
        })
    }

    fn load_records(
        &self,
        aggregate_id: Uuid,
    ) -> BoxFuture<'_, Result<Vec<WorkItemEventRecord>, EventStoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT aggregate_id, event_type, event_data, version, created_at
                FROM {}
                WHERE aggregate_id = $1
                ORDER BY version ASC
                ",
                self.schema.events()
            ))
            .bind(aggregate_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            rows.iter()
                .map(|row| {
                    let decode = |e: sqlx::Error| EventStoreError::DatabaseError(e.to_string());
                    Ok(WorkItemEventRecord {
                        aggregate_id: row.try_get("aggregate_id").map_err(decode)?,
                        event_type: row.try_get("event_type").map_err(decode)?,
                        event_data: row.try_get("event_data").map_err(decode)?,
                        version: row.try_get("version").map_err(decode)?,
                        created_at: row.try_get("created_at").map_err(decode)?,
                    })
                })
                .collect()
        })
    }
}
