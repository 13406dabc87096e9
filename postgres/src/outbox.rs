//! `PostgreSQL` outbox store.
//!
//! # Leasing
//!
//! [`OutboxStore::claim_pending`] opens a transaction and locks up to `limit`
//! `PENDING` rows with `FOR UPDATE SKIP LOCKED`. The returned batch owns that
//! transaction: concurrent relays skip the locked rows instead of blocking on
//! them, and dropping the batch rolls back, leaving the rows `PENDING`.

use crate::Schema;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use relayflow_core::dead_letter::DeadLetterEntry;
use relayflow_core::outbox::{
    NewOutboxEntry, OutboxBatch, OutboxEntry, OutboxError, OutboxSink, OutboxStatus, OutboxStore,
    OutboxUnitOfWork, RequeueReport,
};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

pub(crate) const OUTBOX_COLUMNS: &str = "id, event_type, aggregate_type, aggregate_id, payload, \
     status, tenant_id, created_at, published_at, retry_count, last_error";

/// Outbox and dead-letter tables of one schema.
///
/// Cheap to clone; the pool is shared.
#[derive(Clone, Debug)]
pub struct PostgresOutboxStore {
    pub(crate) pool: PgPool,
    pub(crate) schema: Schema,
}

impl PostgresOutboxStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The schema owning the tables.
    #[must_use]
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> OutboxError + '_ {
    move |e| OutboxError::DatabaseError(format!("{context}: {e}"))
}

/// Convert a database row to an [`OutboxEntry`].
pub(crate) fn outbox_from_row(row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let decode = db_error("Failed to decode outbox row");
    let status: String = row.try_get("status").map_err(&decode)?;

    Ok(OutboxEntry {
        id: row.try_get("id").map_err(&decode)?,
        event_type: row.try_get("event_type").map_err(&decode)?,
        aggregate_type: row.try_get("aggregate_type").map_err(&decode)?,
        aggregate_id: row.try_get("aggregate_id").map_err(&decode)?,
        payload: row.try_get("payload").map_err(&decode)?,
        status: status.parse()?,
        tenant_id: row.try_get("tenant_id").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
        published_at: row.try_get("published_at").map_err(&decode)?,
        retry_count: row.try_get("retry_count").map_err(&decode)?,
        last_error: row.try_get("last_error").map_err(&decode)?,
    })
}

/// Insert a `PENDING` row on an open connection.
pub(crate) async fn insert_outbox_row(
    conn: &mut PgConnection,
    schema: &Schema,
    entry: NewOutboxEntry,
) -> Result<OutboxEntry, OutboxError> {
    sqlx::query(&format!(
        r"
        INSERT INTO {} (
            id, event_type, aggregate_type, aggregate_id, payload,
            status, tenant_id, created_at, retry_count
        ) VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7, 0)
        ",
        schema.outbox()
    ))
    .bind(entry.id)
    .bind(&entry.event_type)
    .bind(&entry.aggregate_type)
    .bind(&entry.aggregate_id)
    .bind(&entry.payload)
    .bind(&entry.tenant_id)
    .bind(entry.created_at)
    .execute(conn)
    .await
    .map_err(db_error("Failed to insert outbox row"))?;

    Ok(entry.into_entry())
}

/// Insert a dead-letter row on an open connection.
pub(crate) async fn insert_dead_letter_row(
    conn: &mut PgConnection,
    schema: &Schema,
    entry: &DeadLetterEntry,
) -> Result<(), OutboxError> {
    sqlx::query(&format!(
        r"
        INSERT INTO {} (
            id, original_event_id, event_type, aggregate_type, aggregate_id,
            payload, tenant_id, retry_count, failure_reason, created_at, failed_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ",
        schema.dead_letters()
    ))
    .bind(entry.id)
    .bind(entry.original_event_id)
    .bind(&entry.event_type)
    .bind(&entry.aggregate_type)
    .bind(&entry.aggregate_id)
    .bind(&entry.payload)
    .bind(&entry.tenant_id)
    .bind(entry.retry_count)
    .bind(&entry.failure_reason)
    .bind(entry.created_at)
    .bind(entry.failed_at)
    .execute(conn)
    .await
    .map_err(db_error("Failed to insert dead-letter row"))?;

    Ok(())
}

/// Move an outbox row to `DEAD_LETTER` and mirror it.
async fn dead_letter_row(
    conn: &mut PgConnection,
    schema: &Schema,
    entry: &DeadLetterEntry,
) -> Result<(), OutboxError> {
    sqlx::query(&format!(
        r"
        UPDATE {}
        SET status = 'DEAD_LETTER', retry_count = $2, last_error = $3
        WHERE id = $1
        ",
        schema.outbox()
    ))
    .bind(entry.original_event_id)
    .bind(entry.retry_count)
    .bind(&entry.failure_reason)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to dead-letter outbox row"))?;

    insert_dead_letter_row(conn, schema, entry).await
}

/// An outbox sink over a borrowed connection or transaction.
///
/// Lets a caller publish inside a transaction it already holds:
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// // ... business writes on &mut *tx ...
/// let mut sink = PgOutboxSink::new(&mut tx, &schema);
/// publisher.publish(&mut sink, request, now).await?;
/// tx.commit().await?;
/// ```
pub struct PgOutboxSink<'c> {
    conn: &'c mut PgConnection,
    schema: &'c Schema,
}

impl<'c> PgOutboxSink<'c> {
    /// Sink writing through `conn`.
    pub const fn new(conn: &'c mut PgConnection, schema: &'c Schema) -> Self {
        Self { conn, schema }
    }
}

impl OutboxSink for PgOutboxSink<'_> {
    fn insert(&mut self, entry: NewOutboxEntry) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>> {
        Box::pin(async move { insert_outbox_row(self.conn, self.schema, entry).await })
    }
}

/// A unit of work owning its transaction.
struct PgOutboxUnitOfWork {
    tx: Transaction<'static, Postgres>,
    schema: Schema,
}

impl OutboxSink for PgOutboxUnitOfWork {
    fn insert(&mut self, entry: NewOutboxEntry) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>> {
        Box::pin(async move { insert_outbox_row(&mut self.tx, &self.schema, entry).await })
    }
}

impl OutboxUnitOfWork for PgOutboxUnitOfWork {
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>> {
        Box::pin(async move {
            self.tx
                .commit()
                .await
                .map_err(db_error("Failed to commit outbox transaction"))
        })
    }
}

/// Rows leased by one relay iteration, with the transaction holding the locks.
struct PgOutboxBatch {
    tx: Transaction<'static, Postgres>,
    schema: Schema,
    entries: Vec<OutboxEntry>,
}

impl OutboxBatch for PgOutboxBatch {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    fn mark_published(
        &mut self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            sqlx::query(&format!(
                "UPDATE {} SET status = 'PUBLISHED', published_at = $2 WHERE id = $1",
                self.schema.outbox()
            ))
            .bind(id)
            .bind(published_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("Failed to mark outbox row published"))?;
            Ok(())
        })
    }

    fn mark_failed(
        &mut self,
        id: Uuid,
        retry_count: i32,
        error: String,
    ) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            sqlx::query(&format!(
                r"
                UPDATE {}
                SET status = 'FAILED', retry_count = $2, last_error = $3
                WHERE id = $1
                ",
                self.schema.outbox()
            ))
            .bind(id)
            .bind(retry_count)
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("Failed to mark outbox row failed"))?;
            Ok(())
        })
    }

    fn mark_dead_letter(
        &mut self,
        entry: DeadLetterEntry,
    ) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move { dead_letter_row(&mut self.tx, &self.schema, &entry).await })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>> {
        Box::pin(async move {
            self.tx
                .commit()
                .await
                .map_err(db_error("Failed to commit relay batch"))
        })
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn OutboxUnitOfWork>, OutboxError>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;
            Ok(Box::new(PgOutboxUnitOfWork {
                tx,
                schema: self.schema.clone(),
            }) as Box<dyn OutboxUnitOfWork>)
        })
    }

    fn claim_pending(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Box<dyn OutboxBatch>, OutboxError>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;

            let rows = sqlx::query(&format!(
                r"
                SELECT {OUTBOX_COLUMNS}
                FROM {}
                WHERE status = 'PENDING'
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                ",
                self.schema.outbox()
            ))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to claim pending outbox rows"))?;

            let entries = rows
                .iter()
                .map(outbox_from_row)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Box::new(PgOutboxBatch {
                tx,
                schema: self.schema.clone(),
                entries,
            }) as Box<dyn OutboxBatch>)
        })
    }

    fn requeue_failed(
        &self,
        limit: usize,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<RequeueReport, OutboxError>> {
        Box::pin(async move {
            let table = self.schema.outbox();
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;

            // Rows that exhausted their budget between relay cycles.
            let exhausted = sqlx::query(&format!(
                r"
                SELECT {OUTBOX_COLUMNS}
                FROM {table}
                WHERE status = 'FAILED' AND retry_count >= $1
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                "
            ))
            .bind(max_retries)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to select exhausted outbox rows"))?;

            let mut dead_lettered = Vec::with_capacity(exhausted.len());
            for row in &exhausted {
                let entry = outbox_from_row(row)?;
                let reason = entry
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retry ceiling reached".to_string());
                let dead = DeadLetterEntry::from_outbox(&entry, entry.retry_count, reason, now);
                dead_letter_row(&mut tx, &self.schema, &dead).await?;
                dead_lettered.push(dead);
            }

            let requeued = sqlx::query(&format!(
                r"
                UPDATE {table}
                SET status = 'PENDING'
                WHERE id IN (
                    SELECT id FROM {table}
                    WHERE status = 'FAILED' AND retry_count < $1
                    ORDER BY created_at ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                "
            ))
            .bind(max_retries)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to requeue failed outbox rows"))?
            .rows_affected();

            tx.commit()
                .await
                .map_err(db_error("Failed to commit requeue"))?;

            Ok(RequeueReport {
                requeued,
                dead_lettered,
            })
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<OutboxEntry>, OutboxError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM {} WHERE id = $1",
                self.schema.outbox()
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load outbox row"))?;

            row.as_ref().map(outbox_from_row).transpose()
        })
    }

    fn count_by_status(
        &self,
    ) -> BoxFuture<'_, Result<BTreeMap<OutboxStatus, i64>, OutboxError>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
                "SELECT status, COUNT(*) FROM {} GROUP BY status",
                self.schema.outbox()
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to count outbox rows"))?;

            let mut counts: BTreeMap<OutboxStatus, i64> =
                OutboxStatus::ALL.into_iter().map(|status| (status, 0)).collect();
            for (status, count) in rows {
                counts.insert(status.parse()?, count);
            }
            Ok(counts)
        })
    }
}
