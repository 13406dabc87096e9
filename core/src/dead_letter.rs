//! Dead Letter Queue types and storage trait.
//!
//! An outbox row whose retry budget is exhausted is mirrored into the dead-letter
//! table. Each dead-letter row is resolved exactly once by an operator:
//!
//! - **retry**: a fresh `PENDING` outbox row carrying the original payload is
//!   inserted, and the dead-letter row is marked `RETRIED`
//! - **discard**: the row is marked `DISCARDED` and the operator's reason is
//!   appended to the stored failure reason
//!
//! A second resolution attempt on the same row fails with
//! [`DeadLetterError::AlreadyResolved`].

use crate::outbox::{OutboxEntry, OutboxError};
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Default page size for [`DeadLetterQuery`].
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Errors from dead-letter operations.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// No dead-letter row with this id.
    #[error("Dead-letter entry {0} not found")]
    NotFound(Uuid),

    /// The row was already retried or discarded.
    #[error("Dead-letter entry {id} already resolved as {resolution}")]
    AlreadyResolved {
        /// The row.
        id: Uuid,
        /// How it was resolved.
        resolution: Resolution,
    },

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Re-inserting into the outbox failed.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// The DLQ stream could not be read.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DeadLetterError {
    /// Stable error code for API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            Self::DatabaseError(_) | Self::Outbox(_) | Self::Transport(_) => "INTERNAL",
        }
    }
}

/// How a dead-letter row was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// Re-queued into the outbox.
    Retried,
    /// Dropped by an operator.
    Discarded,
}

impl Resolution {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retried => "RETRIED",
            Self::Discarded => "DISCARDED",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = DeadLetterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RETRIED" => Ok(Self::Retried),
            "DISCARDED" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::DatabaseError(format!(
                "Invalid resolution: {s}"
            ))),
        }
    }
}

/// A row of the dead-letter table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Dead-letter row id.
    pub id: Uuid,
    /// The outbox row that was dead-lettered.
    pub original_event_id: Uuid,
    /// Contract event type.
    pub event_type: String,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Original payload.
    pub payload: Value,
    /// Owning tenant.
    pub tenant_id: String,
    /// Attempts made before giving up.
    pub retry_count: i32,
    /// Last delivery error, plus any discard note.
    pub failure_reason: String,
    /// When the original outbox row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// When an operator resolved it.
    pub resolved_at: Option<DateTime<Utc>>,
    /// How it was resolved.
    pub resolution: Option<Resolution>,
}

impl DeadLetterEntry {
    /// Mirror an outbox row that just exhausted its retries.
    #[must_use]
    pub fn from_outbox(
        entry: &OutboxEntry,
        retry_count: i32,
        failure_reason: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_event_id: entry.id,
            event_type: entry.event_type.clone(),
            aggregate_type: entry.aggregate_type.clone(),
            aggregate_id: entry.aggregate_id.clone(),
            payload: entry.payload.clone(),
            tenant_id: entry.tenant_id.clone(),
            retry_count,
            failure_reason: failure_reason.into(),
            created_at: entry.created_at,
            failed_at,
            resolved_at: None,
            resolution: None,
        }
    }

    /// Whether an operator already acted on this row.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Reject a second resolution.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::AlreadyResolved`] if the row is resolved.
    pub fn ensure_unresolved(&self) -> Result<(), DeadLetterError> {
        match (self.resolved_at, self.resolution) {
            (None, _) => Ok(()),
            (Some(_), resolution) => Err(DeadLetterError::AlreadyResolved {
                id: self.id,
                resolution: resolution.unwrap_or(Resolution::Discarded),
            }),
        }
    }
}

/// Failure reason after a discard: the operator's note is appended.
#[must_use]
pub fn discarded_reason(failure_reason: &str, operator_reason: &str) -> String {
    if failure_reason.is_empty() {
        format!("Discarded: {operator_reason}")
    } else {
        format!("{failure_reason} | Discarded: {operator_reason}")
    }
}

/// Filter and page for listing dead-letter rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterQuery {
    /// Tenant whose rows to list.
    pub tenant_id: String,
    /// `Some(true)` resolved only, `Some(false)` unresolved only.
    pub resolved: Option<bool>,
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Page size.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl DeadLetterQuery {
    /// All rows of a tenant, first page.
    #[must_use]
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resolved: None,
            event_type: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`, offset clamped to `>= 0`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, MAX_PAGE_SIZE);
        self.offset = self.offset.max(0);
        self
    }

    /// Whether a row passes the filter (ignores paging).
    #[must_use]
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        entry.tenant_id == self.tenant_id
            && self.resolved.is_none_or(|resolved| entry.is_resolved() == resolved)
            && self
                .event_type
                .as_deref()
                .is_none_or(|event_type| entry.event_type == event_type)
    }
}

/// One page of dead-letter rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPage {
    /// Rows on this page, most recent failure first.
    pub items: Vec<DeadLetterEntry>,
    /// Rows matching the filter across all pages.
    pub total: i64,
    /// Page size used.
    pub limit: i64,
    /// Offset used.
    pub offset: i64,
}

/// The dead-letter table.
pub trait DeadLetterStore: Send + Sync {
    /// List rows matching a filter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::DatabaseError`] if the query fails.
    fn list(&self, query: DeadLetterQuery)
    -> BoxFuture<'_, Result<DeadLetterPage, DeadLetterError>>;

    /// Fetch one row.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::DatabaseError`] if the query fails.
    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<DeadLetterEntry>, DeadLetterError>>;

    /// Atomically insert a fresh `PENDING` outbox row with the original payload and
    /// mark this row `RETRIED`.
    ///
    /// # Errors
    ///
    /// [`DeadLetterError::NotFound`], [`DeadLetterError::AlreadyResolved`], or a
    /// database error.
    fn retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OutboxEntry, DeadLetterError>>;

    /// Mark this row `DISCARDED`, appending `reason` to the failure reason.
    ///
    /// # Errors
    ///
    /// [`DeadLetterError::NotFound`], [`DeadLetterError::AlreadyResolved`], or a
    /// database error.
    fn discard(
        &self,
        id: Uuid,
        reason: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<DeadLetterEntry, DeadLetterError>>;

    /// Number of rows not yet resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::DatabaseError`] if the query fails.
    fn count_unresolved(&self) -> BoxFuture<'_, Result<i64, DeadLetterError>>;
}
