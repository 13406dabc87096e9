//! The WorkItem aggregate: a finite-state machine for one unit of orchestrated work.
//!
//! # States
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            ▼                              │
//!  TODO ──► IN_PROGRESS ──► SUBMITTED ──► REWORK
//!   │          │    │           │           │
//!   │          │    └──► DONE ◄─┘ (force)   │
//!   ▼          ▼                            ▼
//!  CANCELLED ◄─┴────────────────────── CANCELLED
//! ```
//!
//! `DONE` and `CANCELLED` are terminal.
//!
//! # Commands and events
//!
//! Every command validates against the transition table, builds exactly one
//! [`DomainEvent`], and applies it through the same [`WorkItem::apply`] used during
//! replay. Because direct execution and replay share one fold, replaying the event
//! log always reproduces the aggregate exactly.
//!
//! Events are buffered on the aggregate until drained. Persisting goes through
//! [`WorkItemRepository::commit`](crate::repository::WorkItemRepository::commit),
//! which drains the buffer as part of the write so events cannot be forgotten.
//!
//! # Example
//!
//! ```
//! use relayflow_core::workitem::{AgentMode, NewWorkItem, WorkItem, WorkItemStatus};
//! use chrono::Utc;
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let now = Utc::now();
//! let mut item = WorkItem::create(
//!     NewWorkItem::new(Uuid::new_v4(), "review-invoice", "review", "tenant-a")
//!         .with_agent_mode(AgentMode::Supervised),
//!     now,
//! );
//!
//! item.start(now)?;
//! item.submit(json!({"approved": true}), None, now)?;
//! item.approve_hitl("looks good", now)?;
//!
//! assert_eq!(item.status(), WorkItemStatus::Done);
//! assert_eq!(item.version(), 4);
//! assert_eq!(item.collect_events().len(), 4);
//! # Ok(())
//! # }
//! ```

use crate::event::{DomainEvent, WorkItemEventKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Reason recorded on events raised by compensation-only transitions.
pub const COMPENSATION_REASON: &str = "saga compensation";

/// Lifecycle status of a WorkItem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    /// Created, not started.
    Todo,
    /// Being worked on.
    InProgress,
    /// Result submitted, awaiting review.
    Submitted,
    /// Finished (terminal).
    Done,
    /// Sent back for rework.
    Rework,
    /// Cancelled (terminal).
    Cancelled,
}

impl WorkItemStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Todo,
        Self::InProgress,
        Self::Submitted,
        Self::Done,
        Self::Rework,
        Self::Cancelled,
    ];

    /// Database/wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::InProgress => "IN_PROGRESS",
            Self::Submitted => "SUBMITTED",
            Self::Done => "DONE",
            Self::Rework => "REWORK",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether no further transitions are accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Targets reachable from this status through the normal transition table.
    #[must_use]
    pub const fn allowed_targets(self) -> &'static [Self] {
        match self {
            Self::Todo => &[Self::InProgress, Self::Cancelled],
            Self::InProgress => &[Self::Submitted, Self::Done, Self::Cancelled],
            Self::Submitted => &[Self::Done, Self::Rework],
            Self::Rework => &[Self::Todo, Self::InProgress, Self::Cancelled],
            Self::Done | Self::Cancelled => &[],
        }
    }

    /// Whether `target` is in the transition table for this status.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid WorkItem status: {s}"))
    }
}

/// Who performs a WorkItem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMode {
    /// A human does the work.
    #[default]
    Manual,
    /// An agent does the work, a human reviews it.
    Supervised,
    /// An agent does the work unattended.
    Autonomous,
    /// An agent does the work and verifies its own result.
    SelfVerify,
}

impl AgentMode {
    /// Database/wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Supervised => "SUPERVISED",
            Self::Autonomous => "AUTONOMOUS",
            Self::SelfVerify => "SELF_VERIFY",
        }
    }
}

/// Errors raised by WorkItem commands.
///
/// These are business-rule violations: surfaced to the caller, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The requested target is not reachable from the current status.
    #[error("Invalid state transition: {current} -> {target}")]
    InvalidStateTransition {
        /// Status the WorkItem is in.
        current: WorkItemStatus,
        /// Status the command tried to reach.
        target: WorkItemStatus,
    },

    /// The WorkItem is in a terminal status.
    #[error("WorkItem {id} is already {status}")]
    AlreadyCompleted {
        /// The WorkItem.
        id: Uuid,
        /// Its terminal status.
        status: WorkItemStatus,
    },
}

impl DomainError {
    /// Stable error code for API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::AlreadyCompleted { .. } => "ALREADY_COMPLETED",
        }
    }
}

/// Parameters for [`WorkItem::create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewWorkItem {
    /// Identifier of the new WorkItem.
    pub id: Uuid,
    /// Orchestration context, if created by a process.
    pub proc_instance_id: Option<Uuid>,
    /// Activity name.
    pub activity_name: String,
    /// Activity category.
    pub activity_type: String,
    /// Assigned principal.
    pub assignee_id: Option<String>,
    /// Who performs the work.
    pub agent_mode: AgentMode,
    /// Owning tenant.
    pub tenant_id: String,
}

impl NewWorkItem {
    /// Create parameters with no process, no assignee and [`AgentMode::Manual`].
    #[must_use]
    pub fn new(
        id: Uuid,
        activity_name: impl Into<String>,
        activity_type: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            proc_instance_id: None,
            activity_name: activity_name.into(),
            activity_type: activity_type.into(),
            assignee_id: None,
            agent_mode: AgentMode::Manual,
            tenant_id: tenant_id.into(),
        }
    }

    /// Attach the owning process instance.
    #[must_use]
    pub const fn with_process(mut self, proc_instance_id: Uuid) -> Self {
        self.proc_instance_id = Some(proc_instance_id);
        self
    }

    /// Assign the WorkItem.
    #[must_use]
    pub fn with_assignee(mut self, assignee_id: impl Into<String>) -> Self {
        self.assignee_id = Some(assignee_id.into());
        self
    }

    /// Set the agent mode.
    #[must_use]
    pub const fn with_agent_mode(mut self, agent_mode: AgentMode) -> Self {
        self.agent_mode = agent_mode;
        self
    }
}

/// One unit of orchestrated work.
///
/// Fields are private: state changes only through commands. The aggregate is not
/// thread-safe; concurrent writers are serialised by the optimistic `version`
/// check in the storage layer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkItem {
    id: Uuid,
    proc_instance_id: Option<Uuid>,
    activity_name: String,
    activity_type: String,
    assignee_id: Option<String>,
    agent_mode: AgentMode,
    status: WorkItemStatus,
    result_data: Value,
    tenant_id: String,
    version: i64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl WorkItem {
    /// Create a WorkItem in `TODO` at version 1, buffering a `Created` event.
    #[must_use]
    pub fn create(new: NewWorkItem, now: DateTime<Utc>) -> Self {
        let event = DomainEvent {
            workitem_id: new.id,
            tenant_id: new.tenant_id,
            occurred_at: now,
            kind: WorkItemEventKind::Created {
                proc_instance_id: new.proc_instance_id,
                activity_name: new.activity_name,
                activity_type: new.activity_type,
                assignee_id: new.assignee_id,
                agent_mode: new.agent_mode,
            },
        };

        let mut item = Self::empty(event.workitem_id, event.tenant_id.clone());
        item.apply(&event);
        item.pending.push(event);
        item
    }

    /// Rebuild a WorkItem from its first historical event.
    ///
    /// Returns `None` unless `first` is a `Created` event.
    #[must_use]
    pub fn from_created(first: &DomainEvent) -> Option<Self> {
        if !matches!(first.kind, WorkItemEventKind::Created { .. }) {
            return None;
        }
        let mut item = Self::empty(first.workitem_id, first.tenant_id.clone());
        item.apply(first);
        Some(item)
    }

    fn empty(id: Uuid, tenant_id: String) -> Self {
        Self {
            id,
            proc_instance_id: None,
            activity_name: String::new(),
            activity_type: String::new(),
            assignee_id: None,
            agent_mode: AgentMode::Manual,
            status: WorkItemStatus::Todo,
            result_data: Value::Object(Map::new()),
            tenant_id,
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Apply an event to the state. Pure: the same sequence always yields the same state.
    ///
    /// Events are facts, so no validation happens here.
    pub fn apply(&mut self, event: &DomainEvent) {
        match &event.kind {
            WorkItemEventKind::Created {
                proc_instance_id,
                activity_name,
                activity_type,
                assignee_id,
                agent_mode,
            } => {
                self.id = event.workitem_id;
                self.tenant_id.clone_from(&event.tenant_id);
                self.proc_instance_id = *proc_instance_id;
                self.activity_name.clone_from(activity_name);
                self.activity_type.clone_from(activity_type);
                self.assignee_id.clone_from(assignee_id);
                self.agent_mode = *agent_mode;
                self.result_data = Value::Object(Map::new());
                self.version = 0;
            },
            WorkItemEventKind::Submitted {
                result,
                verification,
            }
            | WorkItemEventKind::Completed {
                result,
                verification,
                ..
            } => {
                self.result_data = outcome(result, verification.as_ref());
            },
            WorkItemEventKind::ReworkRequested { reason } => {
                self.merge_result("rework_reason", Value::String(reason.clone()));
            },
            WorkItemEventKind::HitlApproved { feedback }
            | WorkItemEventKind::HitlRejected { feedback } => {
                self.merge_result("hitl_feedback", Value::String(feedback.clone()));
            },
            WorkItemEventKind::Started
            | WorkItemEventKind::Cancelled { .. }
            | WorkItemEventKind::Reverted { .. } => {},
        }

        self.status = event.kind.resulting_status();
        self.version += 1;
    }

    fn merge_result(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.result_data {
            map.insert(key.to_string(), value);
        } else {
            let mut map = Map::new();
            map.insert("result".to_string(), self.result_data.take());
            map.insert(key.to_string(), value);
            self.result_data = Value::Object(map);
        }
    }

    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::AlreadyCompleted {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn transition(
        &mut self,
        target: WorkItemStatus,
        kind: WorkItemEventKind,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if !self.status.can_transition_to(target) {
            return Err(DomainError::InvalidStateTransition {
                current: self.status,
                target,
            });
        }
        self.record(kind, now);
        Ok(())
    }

    fn record(&mut self, kind: WorkItemEventKind, now: DateTime<Utc>) {
        let event = DomainEvent {
            workitem_id: self.id,
            tenant_id: self.tenant_id.clone(),
            occurred_at: now,
            kind,
        };
        self.apply(&event);
        self.pending.push(event);
    }

    /// `TODO → IN_PROGRESS`.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] on a terminal item,
    /// [`DomainError::InvalidStateTransition`] from any other status but `TODO`/`REWORK`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition(WorkItemStatus::InProgress, WorkItemEventKind::Started, now)
    }

    /// `IN_PROGRESS → SUBMITTED`, storing the result and the verification outcome.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] or [`DomainError::InvalidStateTransition`].
    pub fn submit(
        &mut self,
        result: Value,
        verification: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.transition(
            WorkItemStatus::Submitted,
            WorkItemEventKind::Submitted {
                result,
                verification,
            },
            now,
        )
    }

    /// Complete the WorkItem.
    ///
    /// `IN_PROGRESS → DONE` directly. A `SUBMITTED` item only completes with
    /// `force = true`: this is the human-in-the-loop approval gate.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] on a terminal item;
    /// [`DomainError::InvalidStateTransition`] for `SUBMITTED` without `force`, or
    /// from `TODO`/`REWORK`.
    pub fn complete(
        &mut self,
        result: Value,
        force: bool,
        verification: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.status == WorkItemStatus::Submitted && !force {
            return Err(DomainError::InvalidStateTransition {
                current: self.status,
                target: WorkItemStatus::Done,
            });
        }
        let forced = self.status == WorkItemStatus::Submitted;
        self.transition(
            WorkItemStatus::Done,
            WorkItemEventKind::Completed {
                result,
                forced,
                verification,
            },
            now,
        )
    }

    /// Cancel from any non-terminal status that lists `CANCELLED` as a target.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] or [`DomainError::InvalidStateTransition`]
    /// (a `SUBMITTED` item must be reviewed first).
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition(
            WorkItemStatus::Cancelled,
            WorkItemEventKind::Cancelled {
                reason: reason.into(),
            },
            now,
        )
    }

    /// `SUBMITTED → REWORK`.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] or [`DomainError::InvalidStateTransition`].
    pub fn request_rework(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.transition(
            WorkItemStatus::Rework,
            WorkItemEventKind::ReworkRequested {
                reason: reason.into(),
            },
            now,
        )
    }

    /// Reviewer approval: `SUBMITTED → DONE`, recording feedback.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] on a terminal item,
    /// [`DomainError::InvalidStateTransition`] unless the item is `SUBMITTED`.
    pub fn approve_hitl(
        &mut self,
        feedback: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.review(
            WorkItemStatus::Done,
            WorkItemEventKind::HitlApproved {
                feedback: feedback.into(),
            },
            now,
        )
    }

    /// Reviewer rejection: `SUBMITTED → REWORK`, recording feedback.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] on a terminal item,
    /// [`DomainError::InvalidStateTransition`] unless the item is `SUBMITTED`.
    pub fn reject_hitl(
        &mut self,
        feedback: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.review(
            WorkItemStatus::Rework,
            WorkItemEventKind::HitlRejected {
                feedback: feedback.into(),
            },
            now,
        )
    }

    fn review(
        &mut self,
        target: WorkItemStatus,
        kind: WorkItemEventKind,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.status != WorkItemStatus::Submitted {
            return Err(DomainError::InvalidStateTransition {
                current: self.status,
                target,
            });
        }
        self.transition(target, kind, now)
    }

    /// Compensation only: `REWORK → TODO` (or `IN_PROGRESS` via `revert_to`).
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] on a terminal item,
    /// [`DomainError::InvalidStateTransition`] unless the item is in `REWORK` and the
    /// target is `TODO` or `IN_PROGRESS`.
    pub fn reset_to_todo(
        &mut self,
        reason: impl Into<String>,
        revert_to: Option<WorkItemStatus>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        let target = revert_to.unwrap_or(WorkItemStatus::Todo);
        if self.status != WorkItemStatus::Rework
            || !matches!(target, WorkItemStatus::Todo | WorkItemStatus::InProgress)
        {
            return Err(DomainError::InvalidStateTransition {
                current: self.status,
                target,
            });
        }
        self.transition(
            target,
            WorkItemEventKind::Reverted {
                reason: reason.into(),
                target,
            },
            now,
        )
    }

    /// Compensation only: move any open item to `REWORK`, bypassing the table.
    ///
    /// No-op on an item already in `REWORK`.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyCompleted`] on a terminal item.
    pub fn mark_rework(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.status != WorkItemStatus::Rework {
            self.record(
                WorkItemEventKind::ReworkRequested {
                    reason: COMPENSATION_REASON.to_string(),
                },
                now,
            );
        }
        Ok(())
    }

    /// Compensation only: cancel any open item, bypassing the table.
    ///
    /// Idempotent on terminal items: nothing happens and no event is raised.
    /// Returns whether a transition took place.
    pub fn force_cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.record(
            WorkItemEventKind::Cancelled {
                reason: COMPENSATION_REASON.to_string(),
            },
            now,
        );
        true
    }

    /// Drain the buffered events. Draining clears the buffer.
    #[must_use = "drained events are lost unless persisted"]
    pub fn collect_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Events raised since the last drain.
    #[must_use]
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Version before the buffered events were applied, i.e. the durable version
    /// the storage layer must still hold for a conditional update to succeed.
    #[must_use]
    pub fn persisted_version(&self) -> i64 {
        self.version - i64::try_from(self.pending.len()).unwrap_or(self.version)
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Owning process instance.
    #[must_use]
    pub const fn proc_instance_id(&self) -> Option<Uuid> {
        self.proc_instance_id
    }

    /// Activity name.
    #[must_use]
    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Activity category.
    #[must_use]
    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    /// Assigned principal.
    #[must_use]
    pub fn assignee_id(&self) -> Option<&str> {
        self.assignee_id.as_deref()
    }

    /// Who performs the work.
    #[must_use]
    pub const fn agent_mode(&self) -> AgentMode {
        self.agent_mode
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> WorkItemStatus {
        self.status
    }

    /// Result payload.
    #[must_use]
    pub const fn result_data(&self) -> &Value {
        &self.result_data
    }

    /// Owning tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Optimistic-lock version, including buffered events.
    #[must_use]
    pub const fn version(&self) -> i64 {
        self.version
    }
}

/// Result payload with the verification outcome attached under `verification`.
fn outcome(result: &Value, verification: Option<&Value>) -> Value {
    let mut map = match result {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other.clone());
            map
        },
    };
    if let Some(verification) = verification {
        map.insert("verification".to_string(), verification.clone());
    }
    Value::Object(map)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn new_item() -> WorkItem {
        WorkItem::create(NewWorkItem::new(Uuid::nil(), "draft", "task", "t1"), now())
    }

    fn submitted_item() -> WorkItem {
        let mut item = new_item();
        item.start(now()).unwrap();
        item.submit(json!({"draft": "v1"}), Some(json!({"passed": true})), now())
            .unwrap();
        item
    }

    #[test]
    fn create_starts_in_todo_at_version_one() {
        let item = new_item();
        assert_eq!(item.status(), WorkItemStatus::Todo);
        assert_eq!(item.version(), 1);
        assert_eq!(item.pending_events().len(), 1);
        assert_eq!(item.persisted_version(), 0);
    }

    #[test]
    fn submit_stores_verification_outcome() {
        let item = submitted_item();
        assert_eq!(item.status(), WorkItemStatus::Submitted);
        assert_eq!(
            item.result_data(),
            &json!({"draft": "v1", "verification": {"passed": true}})
        );
    }

    #[test]
    fn complete_on_submitted_requires_force() {
        let mut item = submitted_item();

        let err = item.complete(json!({}), false, None, now()).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidStateTransition {
                current: WorkItemStatus::Submitted,
                target: WorkItemStatus::Done,
            }
        );
        assert_eq!(item.version(), 3);

        item.complete(json!({"final": true}), true, None, now()).unwrap();
        assert_eq!(item.status(), WorkItemStatus::Done);
        assert_eq!(item.result_data(), &json!({"final": true}));
        assert!(matches!(
            item.pending_events().last().map(|e| &e.kind),
            Some(WorkItemEventKind::Completed { forced: true, .. })
        ));
    }

    #[test]
    fn complete_from_in_progress_is_direct() {
        let mut item = new_item();
        item.start(now()).unwrap();
        item.complete(json!("ok"), false, None, now()).unwrap();
        assert_eq!(item.status(), WorkItemStatus::Done);
        assert_eq!(item.result_data(), &json!({"result": "ok"}));
    }

    #[test]
    fn terminal_items_reject_commands() {
        let mut item = new_item();
        item.cancel("not needed", now()).unwrap();

        let err = item.start(now()).unwrap_err();
        assert_eq!(err.code(), "ALREADY_COMPLETED");
        assert!(item.mark_rework(now()).is_err());
        assert!(!item.force_cancel(now()));
        assert_eq!(item.version(), 2);
    }

    #[test]
    fn hitl_feedback_is_merged() {
        let mut item = submitted_item();
        item.reject_hitl("needs sources", now()).unwrap();
        assert_eq!(item.status(), WorkItemStatus::Rework);
        assert_eq!(item.result_data()["hitl_feedback"], json!("needs sources"));
        assert_eq!(item.result_data()["draft"], json!("v1"));
    }

    #[test]
    fn approve_requires_submitted() {
        let mut item = new_item();
        item.start(now()).unwrap();
        let err = item.approve_hitl("ok", now()).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidStateTransition {
                current: WorkItemStatus::InProgress,
                target: WorkItemStatus::Done,
            }
        );
    }

    #[test]
    fn submitted_items_cannot_be_cancelled_directly() {
        let mut item = submitted_item();
        assert!(matches!(
            item.cancel("x", now()),
            Err(DomainError::InvalidStateTransition { .. })
        ));
        assert!(item.force_cancel(now()));
        assert_eq!(item.status(), WorkItemStatus::Cancelled);
    }

    #[test]
    fn reset_to_todo_only_from_rework() {
        let mut item = submitted_item();
        assert!(item.reset_to_todo("undo", None, now()).is_err());

        item.request_rework("fix typos", now()).unwrap();
        item.reset_to_todo("undo", Some(WorkItemStatus::InProgress), now())
            .unwrap();
        assert_eq!(item.status(), WorkItemStatus::InProgress);
    }

    #[test]
    fn reset_to_todo_rejects_other_targets() {
        let mut item = submitted_item();
        item.request_rework("fix", now()).unwrap();
        let err = item
            .reset_to_todo("undo", Some(WorkItemStatus::Done), now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn mark_rework_bypasses_table_and_is_idempotent() {
        let mut item = new_item();
        item.mark_rework(now()).unwrap();
        assert_eq!(item.status(), WorkItemStatus::Rework);
        item.mark_rework(now()).unwrap();
        assert_eq!(item.version(), 2);
    }

    #[test]
    fn collect_events_clears_buffer() {
        let mut item = new_item();
        item.start(now()).unwrap();
        let events = item.collect_events();
        assert_eq!(events.len(), 2);
        assert!(item.pending_events().is_empty());
        assert_eq!(item.persisted_version(), 2);
    }

    #[test]
    fn transition_table_has_no_exits_from_terminal_states() {
        for status in WorkItemStatus::ALL {
            assert_eq!(status.is_terminal(), status.allowed_targets().is_empty());
            assert_eq!(status.as_str().parse::<WorkItemStatus>(), Ok(status));
        }
    }

    #[derive(Clone, Debug)]
    enum Command {
        Start,
        Submit,
        Complete(bool),
        Cancel,
        Rework,
        Approve,
        Reject,
        Reset,
        MarkRework,
        ForceCancel,
    }

    fn command() -> impl Strategy<Value = Command> {
        prop_oneof![
            Just(Command::Start),
            Just(Command::Submit),
            any::<bool>().prop_map(Command::Complete),
            Just(Command::Cancel),
            Just(Command::Rework),
            Just(Command::Approve),
            Just(Command::Reject),
            Just(Command::Reset),
            Just(Command::MarkRework),
            Just(Command::ForceCancel),
        ]
    }

    /// Runs a command; returns whether it transitioned.
    fn run(item: &mut WorkItem, command: &Command) -> bool {
        let before = item.version();
        let outcome = match command {
            Command::Start => item.start(now()),
            Command::Submit => item.submit(json!({"n": 1}), None, now()),
            Command::Complete(force) => item.complete(json!({"n": 2}), *force, None, now()),
            Command::Cancel => item.cancel("c", now()),
            Command::Rework => item.request_rework("r", now()),
            Command::Approve => item.approve_hitl("a", now()),
            Command::Reject => item.reject_hitl("j", now()),
            Command::Reset => item.reset_to_todo("z", None, now()),
            Command::MarkRework => item.mark_rework(now()),
            Command::ForceCancel => {
                item.force_cancel(now());
                Ok(())
            },
        };
        outcome.is_ok() && item.version() != before
    }

    proptest! {
        #[test]
        fn version_is_one_plus_transitions(commands in prop::collection::vec(command(), 0..40)) {
            let mut item = new_item();
            let mut transitions = 0;
            for command in &commands {
                let events_before = item.pending_events().len();
                if run(&mut item, command) {
                    transitions += 1;
                    prop_assert_eq!(item.pending_events().len(), events_before + 1);
                } else {
                    prop_assert_eq!(item.pending_events().len(), events_before);
                }
            }
            prop_assert_eq!(item.version(), 1 + transitions);
        }

        #[test]
        fn terminal_status_is_permanent(commands in prop::collection::vec(command(), 0..40)) {
            let mut item = new_item();
            let mut terminal: Option<WorkItemStatus> = None;
            for command in &commands {
                let changed = run(&mut item, command);
                if let Some(status) = terminal {
                    prop_assert!(!changed);
                    prop_assert_eq!(item.status(), status);
                } else if item.status().is_terminal() {
                    terminal = Some(item.status());
                }
            }
        }

        #[test]
        fn replaying_events_reproduces_state(commands in prop::collection::vec(command(), 0..40)) {
            let mut item = new_item();
            for command in &commands {
                run(&mut item, command);
            }
            let events = item.collect_events();

            let mut replayed = WorkItem::from_created(&events[0]).unwrap();
            for event in &events[1..] {
                replayed.apply(event);
            }

            prop_assert_eq!(replayed, item);
        }
    }
}
