//! Schema migrations.
//!
//! Migrations are embedded and applied in order, each in its own transaction,
//! and recorded in `<schema>.schema_migrations` so they run once. Statements
//! use `{schema}` as a placeholder for the configured schema, which is why the
//! `sqlx::migrate!` file loader (fixed SQL) is not used here.

use crate::{PostgresError, Schema};
use sqlx::PgPool;

/// One embedded migration.
#[derive(Clone, Copy, Debug)]
pub struct Migration {
    /// Sortable identifier recorded once applied.
    pub version: &'static str,
    /// Statements, executed in order.
    pub statements: &'static [&'static str],
}

/// Every migration, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_event_outbox",
        statements: &[
            r"
            CREATE TABLE IF NOT EXISTS {schema}.event_outbox (
                id UUID PRIMARY KEY,
                event_type TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'PUBLISHED', 'FAILED', 'DEAD_LETTER')),
                tenant_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                published_at TIMESTAMPTZ,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_event_outbox_pending
                ON {schema}.event_outbox (created_at)
                WHERE status = 'PENDING'
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_event_outbox_failed
                ON {schema}.event_outbox (created_at)
                WHERE status = 'FAILED'
            ",
        ],
    },
    Migration {
        version: "0002_dead_letter_events",
        statements: &[
            r"
            CREATE TABLE IF NOT EXISTS {schema}.dead_letter_events (
                id UUID PRIMARY KEY,
                original_event_id UUID NOT NULL,
                event_type TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                tenant_id TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                failure_reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                resolved_at TIMESTAMPTZ,
                resolution TEXT CHECK (resolution IN ('RETRIED', 'DISCARDED'))
            )
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_dead_letter_events_tenant
                ON {schema}.dead_letter_events (tenant_id, failed_at DESC)
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_dead_letter_events_unresolved
                ON {schema}.dead_letter_events (failed_at)
                WHERE resolved_at IS NULL
            ",
        ],
    },
    Migration {
        version: "0003_work_items",
        statements: &[
            r"
            CREATE TABLE IF NOT EXISTS {schema}.work_item_events (
                id BIGSERIAL PRIMARY KEY,
                aggregate_id UUID NOT NULL,
                event_type TEXT NOT NULL,
                event_data JSONB NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (aggregate_id, version)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS {schema}.work_items (
                id UUID PRIMARY KEY,
                proc_instance_id UUID,
                activity_name TEXT NOT NULL,
                activity_type TEXT NOT NULL,
                assignee_id TEXT,
                agent_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                result_data JSONB NOT NULL DEFAULT '{}'::jsonb,
                tenant_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_work_items_process
                ON {schema}.work_items (proc_instance_id)
            ",
        ],
    },
];

/// Create the schema and apply pending migrations.
///
/// Safe to call on every start; applied migrations are skipped.
///
/// # Errors
///
/// Returns [`PostgresError::Migration`] if a statement fails. The failing
/// migration is rolled back; earlier ones stay applied.
pub async fn migrate(pool: &PgPool, schema: &Schema) -> Result<(), PostgresError> {
    let fail = |e: sqlx::Error| PostgresError::Migration(e.to_string());

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(pool)
        .await
        .map_err(fail)?;

    sqlx::query(&format!(
        r"
        CREATE TABLE IF NOT EXISTS {schema}.schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "
    ))
    .execute(pool)
    .await
    .map_err(fail)?;

    for migration in MIGRATIONS {
        let mut tx = pool.begin().await.map_err(fail)?;

        // The lock serialises concurrent starters on the bookkeeping table.
        sqlx::query(&format!(
            "LOCK TABLE {schema}.schema_migrations IN EXCLUSIVE MODE"
        ))
        .execute(&mut *tx)
        .await
        .map_err(fail)?;

        let applied: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT version FROM {schema}.schema_migrations WHERE version = $1"
        ))
        .bind(migration.version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(fail)?;

        if applied.is_some() {
            tx.rollback().await.map_err(fail)?;
            continue;
        }

        for statement in migration.statements {
            sqlx::query(&statement.replace("{schema}", schema.as_str()))
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    PostgresError::Migration(format!("{}: {e}", migration.version))
                })?;
        }

        sqlx::query(&format!(
            "INSERT INTO {schema}.schema_migrations (version) VALUES ($1)"
        ))
        .bind(migration.version)
        .execute(&mut *tx)
        .await
        .map_err(fail)?;

        tx.commit().await.map_err(fail)?;
        tracing::info!(schema = %schema, version = migration.version, "Applied migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_unique() {
        let versions: Vec<&str> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn every_statement_is_schema_qualified() {
        for migration in MIGRATIONS {
            for statement in migration.statements {
                assert!(statement.contains("{schema}."), "{}", migration.version);
            }
        }
    }
}
