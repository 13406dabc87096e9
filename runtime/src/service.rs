//! WorkItem command service: load → command → commit.
//!
//! Every mutation replays the WorkItem from its event log, runs one command, and
//! commits the resulting events through the repository in a single transaction.
//! On a concurrency conflict the whole cycle can be re-run against a freshly
//! loaded aggregate (`with_conflict_retries`); by default the conflict is
//! returned to the caller.

use chrono::{DateTime, Utc};
use relayflow_core::environment::Clock;
use relayflow_core::repository::{RepositoryError, WorkItemRepository};
use relayflow_core::workitem::{DomainError, NewWorkItem, WorkItem, WorkItemStatus};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Application service over the WorkItem aggregate.
#[derive(Clone)]
pub struct WorkItemService {
    repository: Arc<dyn WorkItemRepository>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl WorkItemService {
    /// Create a service that surfaces conflicts immediately.
    #[must_use]
    pub fn new(repository: Arc<dyn WorkItemRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            conflict_retries: 0,
        }
    }

    /// Re-run a command up to `retries` more times after a concurrency conflict.
    #[must_use]
    pub const fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Create and persist a WorkItem in `TODO`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] if the id is taken, or a storage error.
    pub async fn create(&self, new: NewWorkItem) -> Result<WorkItem, RepositoryError> {
        let mut item = WorkItem::create(new, self.clock.now());
        let events = self.repository.commit(&mut item).await?;
        tracing::info!(
            workitem_id = %item.id(),
            tenant_id = %item.tenant_id(),
            events = events.len(),
            "WorkItem created"
        );
        Ok(item)
    }

    /// Load the current state.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] or a storage error.
    pub async fn get(&self, id: Uuid) -> Result<WorkItem, RepositoryError> {
        self.repository.load(id).await
    }

    /// Current status from the projection.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] or a storage error.
    pub async fn status_of(&self, id: Uuid) -> Result<WorkItemStatus, RepositoryError> {
        self.repository.status_of(id).await
    }

    /// Load, run `command`, commit.
    ///
    /// # Errors
    ///
    /// The command's [`DomainError`] (nothing is written), a conflict once retries
    /// are exhausted, or a storage error.
    pub async fn execute<F>(&self, id: Uuid, command: F) -> Result<WorkItem, RepositoryError>
    where
        F: Fn(&mut WorkItem, DateTime<Utc>) -> Result<(), DomainError> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let mut item = self.repository.load(id).await?;
            command(&mut item, self.clock.now())?;

            match self.repository.commit(&mut item).await {
                Ok(events) => {
                    tracing::debug!(
                        workitem_id = %id,
                        status = %item.status(),
                        version = item.version(),
                        events = events.len(),
                        "WorkItem command committed"
                    );
                    return Ok(item);
                },
                Err(e) if e.is_retryable() && attempt < self.conflict_retries => {
                    attempt += 1;
                    tracing::warn!(workitem_id = %id, attempt, "WorkItem conflict, reloading");
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// `TODO → IN_PROGRESS`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn start(&self, id: Uuid) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.start(now)).await
    }

    /// `IN_PROGRESS → SUBMITTED`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn submit(
        &self,
        id: Uuid,
        result: Value,
        verification: Option<Value>,
    ) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| {
            item.submit(result.clone(), verification.clone(), now)
        })
        .await
    }

    /// Complete; `force` is required for a `SUBMITTED` item.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn complete(
        &self,
        id: Uuid,
        result: Value,
        force: bool,
        verification: Option<Value>,
    ) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| {
            item.complete(result.clone(), force, verification.clone(), now)
        })
        .await
    }

    /// Cancel.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.cancel(reason, now)).await
    }

    /// `SUBMITTED → REWORK`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn request_rework(&self, id: Uuid, reason: &str) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.request_rework(reason, now))
            .await
    }

    /// Reviewer approval.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn approve_hitl(&self, id: Uuid, feedback: &str) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.approve_hitl(feedback, now))
            .await
    }

    /// Reviewer rejection.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn reject_hitl(&self, id: Uuid, feedback: &str) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.reject_hitl(feedback, now))
            .await
    }

    /// Compensation only: `REWORK → TODO` (or `IN_PROGRESS`).
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn reset_to_todo(
        &self,
        id: Uuid,
        reason: &str,
        revert_to: Option<WorkItemStatus>,
    ) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.reset_to_todo(reason, revert_to, now))
            .await
    }

    /// Compensation only: move an open item to `REWORK`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn mark_rework(&self, id: Uuid) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| item.mark_rework(now)).await
    }

    /// Compensation only: cancel an open item; no-op on a terminal one.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn force_cancel(&self, id: Uuid) -> Result<WorkItem, RepositoryError> {
        self.execute(id, |item, now| {
            item.force_cancel(now);
            Ok(())
        })
        .await
    }
}
