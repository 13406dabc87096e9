//! Event store trait and replay for the WorkItem event log.
//!
//! The event log is an append-only table of [`WorkItemEventRecord`]s, unique on
//! `(aggregate_id, version)`. The unique constraint is the concurrency guard: two
//! writers appending the same version race, the loser's insert fails, and the store
//! reports [`EventStoreError::ConcurrencyConflict`]. The store never retries; the
//! caller reloads the aggregate and decides.
//!
//! The log is the source of truth for a WorkItem. [`replay`] is a pure fold over
//! the log through [`WorkItem::apply`], the same function commands use, so a
//! replayed aggregate is identical to one built by issuing the commands directly.
//!
//! # Versions
//!
//! A record's `version` is the aggregate version *after* its event: the `Created`
//! record is version 1, the next is 2, and so on.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `relayflow-postgres`): production
//! - `InMemoryEventStore` (in `relayflow-testing`): fast, deterministic tests

use crate::event::{DomainEvent, EventError};
use crate::workitem::WorkItem;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the version is already taken.
    ///
    /// Another writer appended to the aggregate first. Reload and re-attempt.
    #[error("Concurrency conflict on {aggregate_id}: version {version} already exists")]
    ConcurrencyConflict {
        /// The aggregate.
        aggregate_id: Uuid,
        /// The version that collided.
        version: i64,
    },

    /// No events recorded for the aggregate.
    #[error("Stream not found: {0}")]
    StreamNotFound(Uuid),

    /// The first record of the stream is not a `Created` event.
    #[error("Stream {0} does not start with a Created event")]
    MissingCreatedEvent(Uuid),

    /// The stored records are inconsistent (gap in versions, foreign aggregate).
    #[error("Corrupt stream {aggregate_id}: {reason}")]
    CorruptStream {
        /// The aggregate.
        aggregate_id: Uuid,
        /// What is wrong.
        reason: String,
    },

    /// Database connection error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Whether reloading and re-attempting can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<EventError> for EventStoreError {
    fn from(error: EventError) -> Self {
        Self::SerializationError(error.to_string())
    }
}

/// A row of the `work_item_events` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItemEventRecord {
    /// The WorkItem.
    pub aggregate_id: Uuid,
    /// Short event name (`"Created"`, `"Started"`, ...).
    pub event_type: String,
    /// Encoded [`DomainEvent`].
    pub event_data: Value,
    /// Aggregate version after this event.
    pub version: i64,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

impl WorkItemEventRecord {
    /// Encode an event at a version.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SerializationError`] if the event cannot be encoded.
    pub fn encode(event: &DomainEvent, version: i64) -> Result<Self, EventStoreError> {
        Ok(Self {
            aggregate_id: event.workitem_id,
            event_type: event.event_type().to_string(),
            event_data: event.to_json()?,
            version,
            created_at: event.occurred_at,
        })
    }

    /// Decode the stored event.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SerializationError`] for malformed data or a type
    /// column that disagrees with the payload.
    pub fn decode(&self) -> Result<DomainEvent, EventStoreError> {
        Ok(DomainEvent::from_record(&self.event_type, &self.event_data)?)
    }
}

/// Append-only WorkItem event log.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Append one event at `expected_version`.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: a record with this version already exists; nothing
    ///   is overwritten
    /// - `DatabaseError`: database connection or query failed
    /// - `SerializationError`: the event could not be encoded
    fn append<'a>(
        &'a self,
        aggregate_id: Uuid,
        event: &'a DomainEvent,
        expected_version: i64,
    ) -> BoxFuture<'a, Result<WorkItemEventRecord, EventStoreError>>;

    /// Append a batch, the first event at `starting_version` and each next one a
    /// version higher.
    ///
    /// Returns the version of the last appended event (`starting_version - 1` for
    /// an empty batch). The default appends one by one and stops at the first
    /// error; durable stores override it to append atomically.
    ///
    /// # Errors
    ///
    /// Same as [`append`](Self::append).
    fn append_events<'a>(
        &'a self,
        aggregate_id: Uuid,
        events: &'a [DomainEvent],
        starting_version: i64,
    ) -> BoxFuture<'a, Result<i64, EventStoreError>> {
        Box::pin(async move {
            let mut version = starting_version;
            for event in events {
                self.append(aggregate_id, event, version).await?;
                version += 1;
            }
            Ok(version - 1)
        })
    }

    /// Load every record of an aggregate ordered by version (empty if unknown).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn load_records(
        &self,
        aggregate_id: Uuid,
    ) -> BoxFuture<'_, Result<Vec<WorkItemEventRecord>, EventStoreError>>;

    /// Rebuild a WorkItem by replaying its records.
    ///
    /// # Errors
    ///
    /// `StreamNotFound` for an unknown aggregate, plus every error of [`replay`].
    fn load(&self, aggregate_id: Uuid) -> BoxFuture<'_, Result<WorkItem, EventStoreError>> {
        Box::pin(async move {
            let records = self.load_records(aggregate_id).await?;
            replay(aggregate_id, &records)
        })
    }
}

/// Fold records (ordered by version) into a WorkItem.
///
/// Pure: identical records always produce identical state, whenever replayed.
///
/// # Errors
///
/// - `StreamNotFound` if `records` is empty
/// - `MissingCreatedEvent` if the first record is not `Created`
/// - `CorruptStream` on a version gap or a record of another aggregate
/// - `SerializationError` if a record cannot be decoded
pub fn replay(aggregate_id: Uuid, records: &[WorkItemEventRecord]) -> Result<WorkItem, EventStoreError> {
    let Some((first, rest)) = records.split_first() else {
        return Err(EventStoreError::StreamNotFound(aggregate_id));
    };

    let created = first.decode()?;
    let mut item = WorkItem::from_created(&created)
        .ok_or(EventStoreError::MissingCreatedEvent(aggregate_id))?;
    check(aggregate_id, first, &created, &item)?;

    for record in rest {
        let event = record.decode()?;
        item.apply(&event);
        check(aggregate_id, record, &event, &item)?;
    }

    Ok(item)
}

fn check(
    aggregate_id: Uuid,
    record: &WorkItemEventRecord,
    event: &DomainEvent,
    item: &WorkItem,
) -> Result<(), EventStoreError> {
    if record.aggregate_id != aggregate_id || event.workitem_id != aggregate_id {
        return Err(EventStoreError::CorruptStream {
            aggregate_id,
            reason: format!("record at version {} belongs to another aggregate", record.version),
        });
    }
    if record.version != item.version() {
        return Err(EventStoreError::CorruptStream {
            aggregate_id,
            reason: format!(
                "expected version {}, found {}",
                item.version(),
                record.version
            ),
        });
    }
    Ok(())
}
