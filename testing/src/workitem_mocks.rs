//! In-memory WorkItem persistence.
//!
//! - [`InMemoryEventStore`]: the `work_item_events` log with its
//!   `(aggregate_id, version)` uniqueness
//! - [`InMemoryWorkItemRepository`]: event log + outbox + status projection,
//!   committed together

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use crate::outbox_mocks::InMemoryOutboxStore;
use futures::future::BoxFuture;
use relayflow_core::contract::ContractRegistry;
use relayflow_core::event::DomainEvent;
use relayflow_core::event_store::{EventStore, EventStoreError, WorkItemEventRecord};
use relayflow_core::outbox::OutboxStore;
use relayflow_core::publisher::EventPublisher;
use relayflow_core::repository::{RepositoryError, WorkItemRepository};
use relayflow_core::workitem::{WorkItem, WorkItemStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// In-memory event log.
///
/// Cloning shares the log.
///
/// # Example
///
/// ```
/// use relayflow_testing::InMemoryEventStore;
/// use relayflow_core::event_store::EventStore;
/// use uuid::Uuid;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// assert!(store.load_records(Uuid::new_v4()).await?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<Mutex<HashMap<Uuid, Vec<WorkItemEventRecord>>>>,
}

impl InMemoryEventStore {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unchecked (for corrupt-stream fixtures).
    pub fn insert_record(&self, record: WorkItemEventRecord) {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(record.aggregate_id).or_default();
        stream.push(record);
        stream.sort_by_key(|record| record.version);
    }

    /// Records of one aggregate ordered by version.
    #[must_use]
    pub fn records(&self, aggregate_id: Uuid) -> Vec<WorkItemEventRecord> {
        self.streams
            .lock()
            .unwrap()
            .get(&aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().values().map(Vec::len).sum()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_all(
        &self,
        aggregate_id: Uuid,
        records: Vec<WorkItemEventRecord>,
    ) -> Result<(), EventStoreError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(aggregate_id).or_default();

        if let Some(taken) = records
            .iter()
            .find(|record| stream.iter().any(|existing| existing.version == record.version))
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                version: taken.version,
            });
        }

        stream.extend(records);
        stream.sort_by_key(|record| record.version);
        Ok(())
    }
}

impl EventStore for InMemoryEventStore {
    fn append<'a>(
        &'a self,
        aggregate_id: Uuid,
        event: &'a DomainEvent,
        expected_version: i64,
    ) -> BoxFuture<'a, Result<WorkItemEventRecord, EventStoreError>> {
        Box::pin(async move {
            let record = WorkItemEventRecord::encode(event, expected_version)?;
            self.append_all(aggregate_id, vec![record.clone()])?;
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
            let records = (starting_version..)
                .zip(events)
                .map(|(version, event)| WorkItemEventRecord::encode(event, version))
                .collect::<Result<Vec<_>, _>>()?;
            let last = records
                .last()
                .map_or(starting_version - 1, |record| record.version);
            self.append_all(aggregate_id, records)?;
            Ok(last)
        })
    }

    fn load_records(
        &self,
        aggregate_id: Uuid,
    ) -> BoxFuture<'_, Result<Vec<WorkItemEventRecord>, EventStoreError>> {
        Box::pin(async move { Ok(self.records(aggregate_id)) })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ProjectionRow {
    status: WorkItemStatus,
    version: i64,
}

/// In-memory WorkItem repository.
///
/// A commit checks the projection version, publishes one outbox row per event,
/// appends to the event log, then updates the projection. Any failure before the
/// outbox unit of work commits leaves every table untouched.
///
/// Commits are serialized, so the version check and the projection update
/// see the same state even when two tasks commit the same item concurrently.
#[derive(Clone, Debug)]
pub struct InMemoryWorkItemRepository {
    events: InMemoryEventStore,
    outbox: InMemoryOutboxStore,
    publisher: EventPublisher,
    projection: Arc<Mutex<HashMap<Uuid, ProjectionRow>>>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryWorkItemRepository {
    /// Repository over the given stores, publishing with the core contracts.
    #[must_use]
    pub fn new(events: InMemoryEventStore, outbox: InMemoryOutboxStore) -> Self {
        Self::with_publisher(
            events,
            outbox,
            EventPublisher::new(Arc::new(ContractRegistry::core())),
        )
    }

    /// Repository with a custom publisher.
    #[must_use]
    pub fn with_publisher(
        events: InMemoryEventStore,
        outbox: InMemoryOutboxStore,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            events,
            outbox,
            publisher,
            projection: Arc::new(Mutex::new(HashMap::new())),
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The event log.
    #[must_use]
    pub const fn event_store(&self) -> &InMemoryEventStore {
        &self.events
    }

    /// The outbox.
    #[must_use]
    pub const fn outbox(&self) -> &InMemoryOutboxStore {
        &self.outbox
    }

    /// Projected version of a WorkItem.
    #[must_use]
    pub fn projected_version(&self, id: Uuid) -> Option<i64> {
        self.projection.lock().unwrap().get(&id).map(|row| row.version)
    }
}

impl WorkItemRepository for InMemoryWorkItemRepository {
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

            let _guard = self.commit_lock.lock().await;
            let id = item.id();
            let expected = item.persisted_version();
            let projected = self.projected_version(id).unwrap_or(0);
            if projected != expected {
                return Err(RepositoryError::Conflict { id, expected });
            }

            let mut unit = self.outbox.begin().await?;
            self.publisher
                .publish_workitem_events(unit.as_mut(), &pending, expected + 1, last.occurred_at)
                .await?;
            self.events.append_events(id, &pending, expected + 1).await?;
            unit.commit().await?;

            self.projection.lock().unwrap().insert(
                id,
                ProjectionRow {
                    status: item.status(),
                    version: item.version(),
                },
            );

            Ok(item.collect_events())
        })
    }

    fn status_of(&self, id: Uuid) -> BoxFuture<'_, Result<WorkItemStatus, RepositoryError>> {
        Box::pin(async move {
            self.projection
                .lock()
                .unwrap()
                .get(&id)
                .map(|row| row.status)
                .ok_or(RepositoryError::NotFound(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::new_workitem;
    use crate::test_clock;
    use relayflow_core::environment::Clock;

    fn started_item() -> (Uuid, Vec<DomainEvent>) {
        let mut item = WorkItem::create(new_workitem("draft"), test_clock().now());
        item.start(test_clock().now()).unwrap();
        (item.id(), item.collect_events())
    }

    fn event_types(store: &InMemoryEventStore, id: Uuid) -> Vec<(i64, String)> {
        store
            .records(id)
            .into_iter()
            .map(|record| (record.version, record.event_type))
            .collect()
    }

    #[tokio::test]
    async fn append_at_a_taken_version_conflicts_and_writes_nothing() {
        let store = InMemoryEventStore::new();
        let (id, events) = started_item();
        assert_eq!(store.append_events(id, &events, 1).await.unwrap(), 2);
        let before = event_types(&store, id);

        let err = store.append(id, &events[1], 2).await.unwrap_err();

        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { version: 2, aggregate_id } if aggregate_id == id
        ));
        assert!(err.is_retryable());
        assert_eq!(event_types(&store, id), before);
    }

    #[tokio::test]
    async fn overlapping_batch_is_rejected_whole() {
        let store = InMemoryEventStore::new();
        let (id, events) = started_item();
        store.append_events(id, &events, 1).await.unwrap();

        // Versions 2 and 3: version 3 is free but must not be written.
        let err = store.append_events(id, &events, 2).await.unwrap_err();

        assert!(matches!(err, EventStoreError::ConcurrencyConflict { version: 2, .. }));
        assert_eq!(
            event_types(&store, id),
            vec![
                (1, "Created".to_string()),
                (2, "Started".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_commits_of_one_version_let_exactly_one_win() {
        let repository =
            InMemoryWorkItemRepository::new(InMemoryEventStore::new(), InMemoryOutboxStore::new());
        let mut item = WorkItem::create(new_workitem("draft"), test_clock().now());
        repository.commit(&mut item).await.unwrap();
        let id = item.id();

        let mut first = repository.load(id).await.unwrap();
        let mut second = repository.load(id).await.unwrap();
        first.start(test_clock().now()).unwrap();
        second.cancel("racing", test_clock().now()).unwrap();

        let a = {
            let repository = repository.clone();
            tokio::spawn(async move { repository.commit(&mut first).await.map(|_| ()) })
        };
        let b = {
            let repository = repository.clone();
            tokio::spawn(async move { repository.commit(&mut second).await.map(|_| ()) })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RepositoryError::Conflict { expected: 1, .. })));
        assert_eq!(repository.event_store().records(id).len(), 2);
        assert_eq!(repository.outbox().entries().len(), 2);
        assert_eq!(repository.projected_version(id), Some(2));
    }
}
