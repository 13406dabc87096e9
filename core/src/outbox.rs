//! Transactional outbox: types and storage traits.
//!
//! The outbox pattern writes an event record in the same transaction as the
//! business mutation, then relays it asynchronously. A committed business change
//! therefore always has an eventually-delivered event, and a rolled-back change
//! never has one.
//!
//! # Lifecycle of a row
//!
//! ```text
//!   publish (caller's tx)
//!          │
//!          ▼
//!      PENDING ──relay ok──► PUBLISHED
//!        ▲   │
//!        │   └─relay fails──► FAILED ──retry_count >= ceiling──► DEAD_LETTER
//!        │                      │
//!        └── retry_failed_once ─┘
//! ```
//!
//! Rows are never deleted: the table doubles as an audit trail.
//!
//! # Seams
//!
//! - [`OutboxSink`]: anything an outbox row can be inserted into (an open transaction)
//! - [`OutboxUnitOfWork`]: a sink that owns its transaction and can commit it
//! - [`OutboxBatch`]: a leased batch of `PENDING` rows the relay is working on
//! - [`OutboxStore`]: the table itself

use crate::contract::EventContractError;
use crate::dead_letter::DeadLetterEntry;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors from outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The event failed contract validation.
    #[error("Event contract violation: {0}")]
    Contract(#[from] EventContractError),

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Delivery status of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting for the relay.
    Pending,
    /// Delivered to the stream transport.
    Published,
    /// Last delivery attempt failed; will be retried.
    Failed,
    /// Retry budget exhausted; mirrored into the dead-letter table.
    DeadLetter,
}

impl OutboxStatus {
    /// Every status.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Published, Self::Failed, Self::DeadLetter];

    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OutboxError::DatabaseError(format!("Invalid outbox status: {s}")))
    }
}

/// A row of the `event_outbox` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Event identifier (also the `event_id` of the stream message).
    pub id: Uuid,
    /// Contract event type.
    pub event_type: String,
    /// Aggregate kind (e.g. `"WorkItem"`).
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Enriched payload.
    pub payload: Value,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Owning tenant.
    pub tenant_id: String,
    /// Insert time; the relay publishes in this order within a batch.
    pub created_at: DateTime<Utc>,
    /// When the relay delivered the row.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed delivery attempts so far.
    pub retry_count: i32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
}

/// An outbox row about to be inserted (always `PENDING`, `retry_count = 0`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    /// Event identifier.
    pub id: Uuid,
    /// Contract event type.
    pub event_type: String,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Enriched payload.
    pub payload: Value,
    /// Owning tenant.
    pub tenant_id: String,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEntry {
    /// The row as it will look once inserted.
    #[must_use]
    pub fn into_entry(self) -> OutboxEntry {
        OutboxEntry {
            id: self.id,
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            payload: self.payload,
            status: OutboxStatus::Pending,
            tenant_id: self.tenant_id,
            created_at: self.created_at,
            published_at: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Outcome of [`OutboxStore::requeue_failed`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequeueReport {
    /// `FAILED` rows moved back to `PENDING`.
    pub requeued: u64,
    /// Dead-letter rows written for `FAILED` rows at or above the ceiling.
    pub dead_lettered: Vec<DeadLetterEntry>,
}

/// Something an outbox row can be inserted into, typically an open transaction.
///
/// The [`EventPublisher`](crate::publisher::EventPublisher) writes through this
/// trait so the row commits or rolls back together with the caller's mutation.
pub trait OutboxSink: Send {
    /// Insert a `PENDING` row.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the insert fails.
    fn insert(&mut self, entry: NewOutboxEntry) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>>;
}

/// A sink that owns its transaction.
///
/// Dropping without [`commit`](Self::commit) rolls back.
pub trait OutboxUnitOfWork: OutboxSink {
    /// Commit every row inserted through this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the commit fails.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>>;
}

/// A batch of `PENDING` rows leased by one relay iteration.
///
/// The lease (a `FOR UPDATE SKIP LOCKED` lock in Postgres) lasts until the batch
/// is committed or dropped, so concurrent relays never see the same rows.
/// Dropping without committing releases the rows unchanged.
pub trait OutboxBatch: Send {
    /// Leased rows ordered by `created_at` ascending.
    fn entries(&self) -> &[OutboxEntry];

    /// Mark a row `PUBLISHED`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn mark_published(
        &mut self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Mark a row `FAILED` with its new retry count.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn mark_failed(
        &mut self,
        id: Uuid,
        retry_count: i32,
        error: String,
    ) -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Mark a row `DEAD_LETTER` and insert its mirrored dead-letter row.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if either write fails.
    fn mark_dead_letter(
        &mut self,
        entry: DeadLetterEntry,
    ) -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Persist every mark and release the lease.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the commit fails.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>>;
}

/// The `event_outbox` table.
pub trait OutboxStore: Send + Sync {
    /// Open a unit of work for publishing outside an existing transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the transaction cannot be opened.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn OutboxUnitOfWork>, OutboxError>>;

    /// Lease up to `limit` `PENDING` rows, oldest first, skipping rows leased elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn claim_pending(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Box<dyn OutboxBatch>, OutboxError>>;

    /// Move up to `limit` `FAILED` rows below `max_retries` back to `PENDING`, and
    /// every `FAILED` row at or above it to `DEAD_LETTER` (with a dead-letter row).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn requeue_failed(
        &self,
        limit: usize,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<RequeueReport, OutboxError>>;

    /// Fetch one row.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<OutboxEntry>, OutboxError>>;

    /// Number of rows per status (statuses with no rows are reported as zero).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn count_by_status(
        &self,
    ) -> BoxFuture<'_, Result<BTreeMap<OutboxStatus, i64>, OutboxError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_its_own_representation() {
        for status in OutboxStatus::ALL {
            assert_eq!(status.as_str().parse::<OutboxStatus>().ok(), Some(status));
        }
        assert!("SENT".parse::<OutboxStatus>().is_err());
    }
}
