//! `PostgreSQL` WorkItem repository.
//!
//! A commit runs in one transaction:
//!
//! 1. upsert the `work_items` projection, guarded by `WHERE version = expected`
//!    (an insert that must not collide for a new WorkItem)
//! 2. append the buffered events to `work_item_events`
//! 3. write one outbox row per event through [`PgOutboxSink`]
//!
//! The aggregate's buffer is drained only after the commit succeeds. `load`
//! always replays the event log; the projection serves [`status_of`] and
//! ad-hoc queries.
//!
//! [`status_of`]: WorkItemRepository::status_of

use crate::event_store::{PostgresEventStore, insert_records};
use crate::outbox::PgOutboxSink;
use crate::Schema;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use relayflow_core::contract::ContractRegistry;
use relayflow_core::event::DomainEvent;
use relayflow_core::event_store::EventStore;
use relayflow_core::publisher::EventPublisher;
use relayflow_core::repository::{RepositoryError, WorkItemRepository};
use relayflow_core::workitem::{WorkItem, WorkItemStatus};
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use uuid::Uuid;

/// WorkItem persistence over the event log, projection and outbox of one schema.
#[derive(Clone, Debug)]
pub struct PostgresWorkItemRepository {
    pool: PgPool,
    schema: Schema,
    events: PostgresEventStore,
    publisher: EventPublisher,
}

impl PostgresWorkItemRepository {
    /// Repository publishing with the core contract catalogue.
    #[must_use]
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self::with_publisher(
            pool,
            schema,
            EventPublisher::new(Arc::new(ContractRegistry::core())),
        )
    }

    /// Repository with a custom publisher.
    #[must_use]
    pub fn with_publisher(pool: PgPool, schema: Schema, publisher: EventPublisher) -> Self {
        Self {
            events: PostgresEventStore::new(pool.clone(), schema.clone()),
            pool,
            schema,
            publisher,
        }
    }

    /// The event log.
    #[must_use]
    pub const fn event_store(&self) -> &PostgresEventStore {
        &self.events
    }

    /// Write the projection row for `item`, expecting `expected` as the stored version.
    ///
    /// Returns `false` when another writer got there first.
    async fn upsert_projection(
        &self,
        conn: &mut PgConnection,
        item: &WorkItem,
        expected: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let table = self.schema.work_items();
        let sql = if expected == 0 {
            format!(
                r"
                INSERT INTO {table} (
                    id, proc_instance_id, activity_name, activity_type, assignee_id,
                    agent_mode, status, result_data, tenant_id, version, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO NOTHING
                "
            )
        } else {
            format!(
                r"
                UPDATE {table}
                SET proc_instance_id = $2, activity_name = $3, activity_type = $4,
                    assignee_id = $5, agent_mode = $6, status = $7, result_data = $8,
                    tenant_id = $9, version = $10, updated_at = $11
                WHERE id = $1 AND version = $12
                "
            )
        };

        let mut query = sqlx::query(&sql)
            .bind(item.id())
            .bind(item.proc_instance_id())
            .bind(item.activity_name())
            .bind(item.activity_type())
            .bind(item.assignee_id())
            .bind(item.agent_mode().as_str())
            .bind(item.status().as_str())
            .bind(item.result_data())
            .bind(item.tenant_id())
            .bind(item.version())
            .bind(updated_at);
        if expected != 0 {
            query = query.bind(expected);
        }

        let result = query
            .execute(conn)
            .await
            .map_err(|e| RepositoryError::DatabaseError(format!("Failed to write projection: {e}")))?;

        Ok(result.rows_affected() == 1)
    }
}

impl WorkItemRepository for PostgresWorkItemRepository {
    fn load(&self, id: Uuid) -> BoxFuture<'_, Result<WorkItem, RepositoryError>> {
        Box::pin(async move { Ok(self.events.load(id).await?) })
    }

    fn commit<'a>(
        &'a self,
        item: &'a mut WorkItem,
    ) -> BoxFuture<'a, Result<Vec<DomainEvent>, RepositoryError>> {
        Box::pin(async move {
            let pending = item.pending_events().to_vec();
            let Some(last) = pending.last() else {
                return Ok(Vec::new());
            };

            let id = item.id();
            let expected = item.persisted_version();
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

            let fresh = self
                .upsert_projection(&mut tx, item, expected, last.occurred_at)
                .await?;
            if !fresh {
                tracing::warn!(workitem_id = %id, expected, "Stale WorkItem write rejected");
                return Err(RepositoryError::Conflict { id, expected });
            }

            insert_records(&mut tx, &self.schema, id, &pending, expected + 1).await?;

            let mut sink = PgOutboxSink::new(&mut tx, &self.schema);
            self.publisher
                .publish_workitem_events(&mut sink, &pending, expected + 1, last.occurred_at)
                .await?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

            tracing::debug!(
                workitem_id = %id,
                version = item.version(),
                events = pending.len(),
                "WorkItem committed"
            );

            Ok(item.collect_events())
        })
    }

    fn status_of(&self, id: Uuid) -> BoxFuture<'_, Result<WorkItemStatus, RepositoryError>> {
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as(&format!(
                "SELECT status FROM {} WHERE id = $1",
                self.schema.work_items()
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

            let (status,) = row.ok_or(RepositoryError::NotFound(id))?;
            status.parse().map_err(RepositoryError::DatabaseError)
        })
    }
}
