//! WorkItem persistence seam.
//!
//! [`WorkItemRepository::commit`] is the only way buffered WorkItem events leave
//! the aggregate. In a single transaction it appends the events to the event log,
//! refreshes the current-state projection with a `WHERE version = expected` guard,
//! and writes one outbox row per event. Events are drained from the aggregate only
//! once that transaction has committed, so they can be neither forgotten nor
//! half-persisted.
//!
//! The event log is canonical; the projection is derived from it and exists for
//! queries such as [`status_of`](WorkItemRepository::status_of).

use crate::event::DomainEvent;
use crate::event_store::EventStoreError;
use crate::outbox::OutboxError;
use crate::workitem::{DomainError, WorkItem, WorkItemStatus};
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

/// Errors from WorkItem persistence.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A command was rejected by the aggregate.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Another writer committed first; reload and re-attempt.
    #[error("WorkItem {id} was modified concurrently (expected version {expected})")]
    Conflict {
        /// The WorkItem.
        id: Uuid,
        /// The durable version this write assumed.
        expected: i64,
    },

    /// No such WorkItem.
    #[error("WorkItem {0} not found")]
    NotFound(Uuid),

    /// The event log failed.
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    /// Writing the outbox rows failed (including contract violations).
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl RepositoryError {
    /// Whether reloading and re-attempting can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Stable error code for API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Domain(e) => e.code(),
            Self::Conflict { .. } => "CONCURRENCY_CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Outbox(OutboxError::Contract(e)) => e.code(),
            Self::EventStore(_) | Self::Outbox(_) | Self::DatabaseError(_) => "INTERNAL",
        }
    }
}

impl From<EventStoreError> for RepositoryError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::ConcurrencyConflict {
                aggregate_id,
                version,
            } => Self::Conflict {
                id: aggregate_id,
                expected: version - 1,
            },
            EventStoreError::StreamNotFound(id) => Self::NotFound(id),
            other => Self::EventStore(other),
        }
    }
}

/// Loads and commits WorkItems.
pub trait WorkItemRepository: Send + Sync {
    /// Rebuild a WorkItem from its event log.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] for an unknown id, or a storage error.
    fn load(&self, id: Uuid) -> BoxFuture<'_, Result<WorkItem, RepositoryError>>;

    /// Persist every buffered event of `item` atomically, then drain them.
    ///
    /// Returns the committed events. With nothing buffered this is a no-op that
    /// returns an empty list.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] when the durable version moved since `item`
    /// was loaded; nothing is written and the buffer is left as it was. Outbox and
    /// storage errors likewise roll back the whole write.
    fn commit<'a>(
        &'a self,
        item: &'a mut WorkItem,
    ) -> BoxFuture<'a, Result<Vec<DomainEvent>, RepositoryError>>;

    /// Current status from the projection, without replaying.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] for an unknown id, or a storage error.
    fn status_of(&self, id: Uuid) -> BoxFuture<'_, Result<WorkItemStatus, RepositoryError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_store_conflict_becomes_retryable_conflict() {
        let err = RepositoryError::from(EventStoreError::ConcurrencyConflict {
            aggregate_id: Uuid::nil(),
            version: 4,
        });
        assert!(err.is_retryable());
        assert!(matches!(err, RepositoryError::Conflict { expected: 3, .. }));
        assert_eq!(err.code(), "CONCURRENCY_CONFLICT");
    }

    #[test]
    fn domain_errors_keep_their_code() {
        let err = RepositoryError::from(DomainError::InvalidStateTransition {
            current: WorkItemStatus::Todo,
            target: WorkItemStatus::Done,
        });
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
    }
}
