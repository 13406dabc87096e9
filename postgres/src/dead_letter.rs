//! Dead-letter table operations of [`PostgresOutboxStore`].
//!
//! Resolution locks the row (`SELECT ... FOR UPDATE`) before checking
//! `resolved_at`, so two operators racing on the same row see exactly one
//! success and one `AlreadyResolved`.

use crate::outbox::{PostgresOutboxStore, insert_outbox_row};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use relayflow_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterPage, DeadLetterQuery, DeadLetterStore, Resolution,
    discarded_reason,
};
use relayflow_core::outbox::{NewOutboxEntry, OutboxEntry};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

const DEAD_LETTER_COLUMNS: &str = "id, original_event_id, event_type, aggregate_type, \
     aggregate_id, payload, tenant_id, retry_count, failure_reason, created_at, failed_at, \
     resolved_at, resolution";

// Nullable parameters keep one statement for every filter combination.
const FILTER: &str = "tenant_id = $1 \
     AND ($2::boolean IS NULL OR (resolved_at IS NOT NULL) = $2) \
     AND ($3::text IS NULL OR event_type = $3)";

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> DeadLetterError + '_ {
    move |e| DeadLetterError::DatabaseError(format!("{context}: {e}"))
}

/// Convert a database row to a [`DeadLetterEntry`].
fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, DeadLetterError> {
    let decode = db_error("Failed to decode dead-letter row");
    let resolution: Option<String> = row.try_get("resolution").map_err(&decode)?;

    Ok(DeadLetterEntry {
        id: row.try_get("id").map_err(&decode)?,
        original_event_id: row.try_get("original_event_id").map_err(&decode)?,
        event_type: row.try_get("event_type").map_err(&decode)?,
        aggregate_type: row.try_get("aggregate_type").map_err(&decode)?,
        aggregate_id: row.try_get("aggregate_id").map_err(&decode)?,
        payload: row.try_get("payload").map_err(&decode)?,
        tenant_id: row.try_get("tenant_id").map_err(&decode)?,
        retry_count: row.try_get("retry_count").map_err(&decode)?,
        failure_reason: row.try_get("failure_reason").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
        failed_at: row.try_get("failed_at").map_err(&decode)?,
        resolved_at: row.try_get("resolved_at").map_err(&decode)?,
        resolution: resolution
            .as_deref()
            .map(str::parse::<Resolution>)
            .transpose()?,
    })
}

impl PostgresOutboxStore {
    /// Lock an unresolved dead-letter row inside `tx`.
    async fn lock_unresolved(
        &self,
        tx: &mut sqlx::PgConnection,
        id: Uuid,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM {} WHERE id = $1 FOR UPDATE",
            self.schema.dead_letters()
        ))
        .bind(id)
        .fetch_optional(tx)
        .await
        .map_err(db_error("Failed to lock dead-letter row"))?
        .ok_or(DeadLetterError::NotFound(id))?;

        let entry = dead_letter_from_row(&row)?;
        entry.ensure_unresolved()?;
        Ok(entry)
    }
}

impl DeadLetterStore for PostgresOutboxStore {
    fn list(
        &self,
        query: DeadLetterQuery,
    ) -> BoxFuture<'_, Result<DeadLetterPage, DeadLetterError>> {
        Box::pin(async move {
            let query = query.normalized();
            let table = self.schema.dead_letters();

            let (total,): (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE {FILTER}"))
                    .bind(&query.tenant_id)
                    .bind(query.resolved)
                    .bind(query.event_type.as_deref())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_error("Failed to count dead-letter rows"))?;

            let rows = sqlx::query(&format!(
                r"
                SELECT {DEAD_LETTER_COLUMNS}
                FROM {table}
                WHERE {FILTER}
                ORDER BY failed_at DESC
                LIMIT $4 OFFSET $5
                "
            ))
            .bind(&query.tenant_id)
            .bind(query.resolved)
            .bind(query.event_type.as_deref())
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list dead-letter rows"))?;

            Ok(DeadLetterPage {
                items: rows
                    .iter()
                    .map(dead_letter_from_row)
                    .collect::<Result<_, _>>()?,
                total,
                limit: query.limit,
                offset: query.offset,
            })
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<DeadLetterEntry>, DeadLetterError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {DEAD_LETTER_COLUMNS} FROM {} WHERE id = $1",
                self.schema.dead_letters()
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load dead-letter row"))?;

            row.as_ref().map(dead_letter_from_row).transpose()
        })
    }

    fn retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OutboxEntry, DeadLetterError>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;

            let dead = self.lock_unresolved(&mut tx, id).await?;

            let requeued = insert_outbox_row(
                &mut tx,
                &self.schema,
                NewOutboxEntry {
                    id: Uuid::new_v4(),
                    event_type: dead.event_type,
                    aggregate_type: dead.aggregate_type,
                    aggregate_id: dead.aggregate_id,
                    payload: dead.payload,
                    tenant_id: dead.tenant_id,
                    created_at: now,
                },
            )
            .await?;

            sqlx::query(&format!(
                "UPDATE {} SET resolved_at = $2, resolution = $3 WHERE id = $1",
                self.schema.dead_letters()
            ))
            .bind(id)
            .bind(now)
            .bind(Resolution::Retried.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to resolve dead-letter row"))?;

            tx.commit()
                .await
                .map_err(db_error("Failed to commit dead-letter retry"))?;

            Ok(requeued)
        })
    }

    fn discard(
        &self,
        id: Uuid,
        reason: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<DeadLetterEntry, DeadLetterError>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;

            let mut dead = self.lock_unresolved(&mut tx, id).await?;
            dead.failure_reason = discarded_reason(&dead.failure_reason, &reason);
            dead.resolved_at = Some(now);
            dead.resolution = Some(Resolution::Discarded);

            sqlx::query(&format!(
                r"
                UPDATE {}
                SET failure_reason = $2, resolved_at = $3, resolution = $4
                WHERE id = $1
                ",
                self.schema.dead_letters()
            ))
            .bind(id)
            .bind(&dead.failure_reason)
            .bind(now)
            .bind(Resolution::Discarded.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to resolve dead-letter row"))?;

            tx.commit()
                .await
                .map_err(db_error("Failed to commit dead-letter discard"))?;

            Ok(dead)
        })
    }

    fn count_unresolved(&self) -> BoxFuture<'_, Result<i64, DeadLetterError>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(&format!(
                "SELECT COUNT(*) FROM {} WHERE resolved_at IS NULL",
                self.schema.dead_letters()
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to count unresolved dead-letter rows"))?;

            Ok(count)
        })
    }
}
