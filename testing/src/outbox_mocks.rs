//! In-memory outbox and dead-letter storage.
//!
//! [`InMemoryOutboxStore`] implements both [`OutboxStore`] and [`DeadLetterStore`]
//! over one shared state, the same way the Postgres store covers both tables.
//! Leasing mirrors `FOR UPDATE SKIP LOCKED`: a claimed row is invisible to other
//! claims until its batch is committed or dropped.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use relayflow_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterPage, DeadLetterQuery, DeadLetterStore,
    Resolution, discarded_reason,
};
use relayflow_core::outbox::{
    NewOutboxEntry, OutboxBatch, OutboxEntry, OutboxError, OutboxSink, OutboxStatus,
    OutboxStore, OutboxUnitOfWork, RequeueReport,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    rows: Vec<OutboxEntry>,
    leased: HashSet<Uuid>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl State {
    fn row_mut(&mut self, id: Uuid) -> Result<&mut OutboxEntry, OutboxError> {
        self.rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| OutboxError::DatabaseError(format!("Outbox row {id} not found")))
    }
}

/// In-memory `event_outbox` and `dead_letter_events` tables.
///
/// Cloning shares the tables.
///
/// # Example
///
/// ```
/// use relayflow_testing::InMemoryOutboxStore;
/// use relayflow_core::outbox::{OutboxStatus, OutboxStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryOutboxStore::new();
/// let batch = store.claim_pending(10).await?;
/// assert!(batch.entries().is_empty());
/// assert_eq!(store.count(OutboxStatus::Pending), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutboxStore {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is, bypassing the publisher (for seeding fixtures).
    pub fn insert_entry(&self, entry: OutboxEntry) {
        self.state.lock().unwrap().rows.push(entry);
    }

    /// Insert a dead-letter row as-is.
    pub fn insert_dead_letter(&self, entry: DeadLetterEntry) {
        self.state.lock().unwrap().dead_letters.push(entry);
    }

    /// Every outbox row in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().unwrap().rows.clone()
    }

    /// One outbox row.
    #[must_use]
    pub fn entry(&self, id: Uuid) -> Option<OutboxEntry> {
        self.state
            .lock()
            .unwrap()
            .rows
            .iter()
            .find(|row| row.id == id)
            .cloned()
    }

    /// Outbox rows with a status.
    #[must_use]
    pub fn with_status(&self, status: OutboxStatus) -> Vec<OutboxEntry> {
        self.state
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|row| row.status == status)
            .cloned()
            .collect()
    }

    /// Number of outbox rows with a status.
    #[must_use]
    pub fn count(&self, status: OutboxStatus) -> usize {
        self.with_status(status).len()
    }

    /// Every dead-letter row in insertion order.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().unwrap().dead_letters.clone()
    }

    /// Number of currently leased rows.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.state.lock().unwrap().leased.len()
    }

    /// Remove every row.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.rows.clear();
        state.leased.clear();
        state.dead_letters.clear();
    }
}

/// Unit of work: rows become visible on commit, vanish on drop.
struct InMemoryUnitOfWork {
    state: Arc<Mutex<State>>,
    staged: Vec<OutboxEntry>,
}

impl OutboxSink for InMemoryUnitOfWork {
    fn insert(&mut self, entry: NewOutboxEntry) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>> {
        Box::pin(async move {
            let entry = entry.into_entry();
            self.staged.push(entry.clone());
            Ok(entry)
        })
    }
}

impl OutboxUnitOfWork for InMemoryUnitOfWork {
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>> {
        Box::pin(async move {
            let Self { state, staged } = *self;
            state.lock().unwrap().rows.extend(staged);
            Ok(())
        })
    }
}

enum Mark {
    Published(Uuid, DateTime<Utc>),
    Failed(Uuid, i32, String),
    DeadLetter(DeadLetterEntry),
}

/// A leased batch. Marks apply on commit; dropping releases the lease.
struct InMemoryBatch {
    state: Arc<Mutex<State>>,
    entries: Vec<OutboxEntry>,
    marks: Vec<Mark>,
    released: bool,
}

impl InMemoryBatch {
    fn ensure_leased(&self, id: Uuid) -> Result<(), OutboxError> {
        if self.entries.iter().any(|entry| entry.id == id) {
            Ok(())
        } else {
            Err(OutboxError::DatabaseError(format!(
                "Outbox row {id} is not part of this batch"
            )))
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(mut state) = self.state.lock() {
            for entry in &self.entries {
                state.leased.remove(&entry.id);
            }
        }
    }
}

impl Drop for InMemoryBatch {
    fn drop(&mut self) {
        self.release();
    }
}

impl OutboxBatch for InMemoryBatch {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    fn mark_published(
        &mut self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            self.ensure_leased(id)?;
            self.marks.push(Mark::Published(id, published_at));
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
            self.ensure_leased(id)?;
            self.marks.push(Mark::Failed(id, retry_count, error));
            Ok(())
        })
    }

    fn mark_dead_letter(
        &mut self,
        entry: DeadLetterEntry,
    ) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            self.ensure_leased(entry.original_event_id)?;
            self.marks.push(Mark::DeadLetter(entry));
            Ok(())
        })
    }

    fn commit(mut self: Box<Self>) -> BoxFuture<'static, Result<(), OutboxError>> {
        Box::pin(async move {
            let marks = std::mem::take(&mut self.marks);
            {
                let mut state = self.state.lock().unwrap();
                for mark in marks {
                    match mark {
                        Mark::Published(id, at) => {
                            let row = state.row_mut(id)?;
                            row.status = OutboxStatus::Published;
                            row.published_at = Some(at);
                        },
                        Mark::Failed(id, retry_count, error) => {
                            let row = state.row_mut(id)?;
                            row.status = OutboxStatus::Failed;
                            row.retry_count = retry_count;
                            row.last_error = Some(error);
                        },
                        Mark::DeadLetter(dead) => {
                            let row = state.row_mut(dead.original_event_id)?;
                            row.status = OutboxStatus::DeadLetter;
                            row.retry_count = dead.retry_count;
                            row.last_error = Some(dead.failure_reason.clone());
                            state.dead_letters.push(dead);
                        },
                    }
                }
            }
            self.release();
            Ok(())
        })
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn OutboxUnitOfWork>, OutboxError>> {
        Box::pin(async move {
            let unit: Box<dyn OutboxUnitOfWork> = Box::new(InMemoryUnitOfWork {
                state: Arc::clone(&self.state),
                staged: Vec::new(),
            });
            Ok(unit)
        })
    }

    fn claim_pending(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Box<dyn OutboxBatch>, OutboxError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let mut pending: Vec<OutboxEntry> = state
                .rows
                .iter()
                .filter(|row| row.status == OutboxStatus::Pending && !state.leased.contains(&row.id))
                .cloned()
                .collect();
            pending.sort_by_key(|row| row.created_at);
            pending.truncate(limit);

            for entry in &pending {
                state.leased.insert(entry.id);
            }

            let batch: Box<dyn OutboxBatch> = Box::new(InMemoryBatch {
                state: Arc::clone(&self.state),
                entries: pending,
                marks: Vec::new(),
                released: false,
            });
            Ok(batch)
        })
    }

    fn requeue_failed(
        &self,
        limit: usize,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<RequeueReport, OutboxError>> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let mut report = RequeueReport::default();

            let mut failed: Vec<usize> = state
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| row.status == OutboxStatus::Failed && !state.leased.contains(&row.id))
                .map(|(index, _)| index)
                .collect();
            failed.sort_by_key(|&index| state.rows[index].created_at);

            for index in failed {
                let row = &mut state.rows[index];
                if row.retry_count >= max_retries {
                    row.status = OutboxStatus::DeadLetter;
                    let reason = row
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "retry ceiling reached".to_string());
                    let dead = DeadLetterEntry::from_outbox(row, row.retry_count, reason, now);
                    state.dead_letters.push(dead.clone());
                    report.dead_lettered.push(dead);
                } else if usize::try_from(report.requeued).unwrap_or(usize::MAX) < limit {
                    row.status = OutboxStatus::Pending;
                    report.requeued += 1;
                }
            }

            Ok(report)
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<OutboxEntry>, OutboxError>> {
        Box::pin(async move { Ok(self.entry(id)) })
    }

    fn count_by_status(
        &self,
    ) -> BoxFuture<'_, Result<BTreeMap<OutboxStatus, i64>, OutboxError>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let mut counts: BTreeMap<OutboxStatus, i64> =
                OutboxStatus::ALL.into_iter().map(|status| (status, 0)).collect();
            for row in &state.rows {
                *counts.entry(row.status).or_default() += 1;
            }
            Ok(counts)
        })
    }
}

impl DeadLetterStore for InMemoryOutboxStore {
    fn list(
        &self,
        query: DeadLetterQuery,
    ) -> BoxFuture<'_, Result<DeadLetterPage, DeadLetterError>> {
        Box::pin(async move {
            let query = query.normalized();
            let state = self.state.lock().unwrap();
            let mut matching: Vec<DeadLetterEntry> = state
                .dead_letters
                .iter()
                .filter(|entry| query.matches(entry))
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

            let total = i64::try_from(matching.len()).unwrap_or(i64::MAX);
            let items = matching
                .into_iter()
                .skip(usize::try_from(query.offset).unwrap_or(0))
                .take(usize::try_from(query.limit).unwrap_or(0))
                .collect();

            Ok(DeadLetterPage {
                items,
                total,
                limit: query.limit,
                offset: query.offset,
            })
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<DeadLetterEntry>, DeadLetterError>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .dead_letters
                .iter()
                .find(|entry| entry.id == id)
                .cloned())
        })
    }

    fn retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OutboxEntry, DeadLetterError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let dead = state
                .dead_letters
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or(DeadLetterError::NotFound(id))?;
            dead.ensure_unresolved()?;

            dead.resolved_at = Some(now);
            dead.resolution = Some(Resolution::Retried);

            let requeued = NewOutboxEntry {
                id: Uuid::new_v4(),
                event_type: dead.event_type.clone(),
                aggregate_type: dead.aggregate_type.clone(),
                aggregate_id: dead.aggregate_id.clone(),
                payload: dead.payload.clone(),
                tenant_id: dead.tenant_id.clone(),
                created_at: now,
            }
            .into_entry();
            state.rows.push(requeued.clone());

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
            let mut state = self.state.lock().unwrap();
            let dead = state
                .dead_letters
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or(DeadLetterError::NotFound(id))?;
            dead.ensure_unresolved()?;

            dead.failure_reason = discarded_reason(&dead.failure_reason, &reason);
            dead.resolved_at = Some(now);
            dead.resolution = Some(Resolution::Discarded);

            Ok(dead.clone())
        })
    }

    fn count_unresolved(&self) -> BoxFuture<'_, Result<i64, DeadLetterError>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let unresolved = state
                .dead_letters
                .iter()
                .filter(|entry| !entry.is_resolved())
                .count();
            Ok(i64::try_from(unresolved).unwrap_or(i64::MAX))
        })
    }
}
