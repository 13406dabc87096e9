//! Domain events emitted by the [`WorkItem`](crate::workitem::WorkItem) aggregate.
//!
//! Events represent facts about things that have happened to a WorkItem. They are
//! produced exclusively by WorkItem commands, buffered on the aggregate, and drained
//! by the persistence layer, which writes them to the event log and the outbox.
//!
//! # Naming
//!
//! Every event has two names:
//!
//! - [`WorkItemEventKind::event_type`]: the short name stored in the event log
//!   (`"Created"`, `"Started"`, ...)
//! - [`WorkItemEventKind::outbox_event_type`]: the contract name published through the
//!   outbox (`"WORKITEM_CREATED"`, `"WORKITEM_STARTED"`, ...)
//!
//! # Example
//!
//! ```
//! use relayflow_core::event::{DomainEvent, WorkItemEventKind};
//! use chrono::Utc;
//! use uuid::Uuid;
//!
//! let event = DomainEvent {
//!     workitem_id: Uuid::new_v4(),
//!     tenant_id: "tenant-a".to_string(),
//!     occurred_at: Utc::now(),
//!     kind: WorkItemEventKind::Started,
//! };
//!
//! assert_eq!(event.event_type(), "Started");
//! assert_eq!(event.kind.outbox_event_type(), "WORKITEM_STARTED");
//! ```

use crate::workitem::{AgentMode, WorkItemStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to JSON.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from JSON.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The stored event type does not match the decoded payload.
    #[error("Event type mismatch: stored {stored}, decoded {decoded}")]
    TypeMismatch {
        /// Event type column value.
        stored: String,
        /// Event type of the decoded payload.
        decoded: String,
    },
}

/// A domain event raised by a WorkItem command.
///
/// Carries the fields common to every event kind plus the kind-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// The WorkItem this event belongs to.
    pub workitem_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// When the command that raised the event ran.
    pub occurred_at: DateTime<Utc>,
    /// Kind-specific payload.
    pub kind: WorkItemEventKind,
}

/// The closed set of WorkItem event kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkItemEventKind {
    /// The WorkItem was created in `TODO`.
    Created {
        /// Orchestration context (weak back-reference).
        proc_instance_id: Option<Uuid>,
        /// Name of the activity this WorkItem executes.
        activity_name: String,
        /// Activity category.
        activity_type: String,
        /// Assigned principal, if any.
        assignee_id: Option<String>,
        /// Who performs the work.
        agent_mode: AgentMode,
    },
    /// Work started.
    Started,
    /// A result was submitted for review.
    Submitted {
        /// Submitted result payload.
        result: Value,
        /// Outcome of automated verification, if any ran.
        verification: Option<Value>,
    },
    /// The WorkItem was completed.
    Completed {
        /// Final result payload.
        result: Value,
        /// Whether a submitted item was force-completed past review.
        forced: bool,
        /// Outcome of automated verification, if any ran.
        verification: Option<Value>,
    },
    /// The WorkItem was cancelled.
    Cancelled {
        /// Why it was cancelled.
        reason: String,
    },
    /// Rework was requested on a submitted result.
    ReworkRequested {
        /// Why rework is needed.
        reason: String,
    },
    /// A human reviewer approved the submitted result.
    HitlApproved {
        /// Reviewer feedback.
        feedback: String,
    },
    /// A human reviewer rejected the submitted result.
    HitlRejected {
        /// Reviewer feedback.
        feedback: String,
    },
    /// A WorkItem in rework was reverted to an earlier state.
    Reverted {
        /// Why it was reverted.
        reason: String,
        /// `TODO` or `IN_PROGRESS`.
        target: WorkItemStatus,
    },
}

impl WorkItemEventKind {
    /// Short event name stored in the event log.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "Created",
            Self::Started => "Started",
            Self::Submitted { .. } => "Submitted",
            Self::Completed { .. } => "Completed",
            Self::Cancelled { .. } => "Cancelled",
            Self::ReworkRequested { .. } => "ReworkRequested",
            Self::HitlApproved { .. } => "HitlApproved",
            Self::HitlRejected { .. } => "HitlRejected",
            Self::Reverted { .. } => "Reverted",
        }
    }

    /// Contract name used when the event is published through the outbox.
    #[must_use]
    pub const fn outbox_event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "WORKITEM_CREATED",
            Self::Started => "WORKITEM_STARTED",
            Self::Submitted { .. } => "WORKITEM_SUBMITTED",
            Self::Completed { .. } => "WORKITEM_COMPLETED",
            Self::Cancelled { .. } => "WORKITEM_CANCELLED",
            Self::ReworkRequested { .. } => "WORKITEM_REWORK_REQUESTED",
            Self::HitlApproved { .. } => "WORKITEM_HITL_APPROVED",
            Self::HitlRejected { .. } => "WORKITEM_HITL_REJECTED",
            Self::Reverted { .. } => "WORKITEM_REVERTED",
        }
    }

    /// The status a WorkItem is in after this event is applied.
    #[must_use]
    pub const fn resulting_status(&self) -> WorkItemStatus {
        match self {
            Self::Created { .. } => WorkItemStatus::Todo,
            Self::Started => WorkItemStatus::InProgress,
            Self::Submitted { .. } => WorkItemStatus::Submitted,
            Self::Completed { .. } | Self::HitlApproved { .. } => WorkItemStatus::Done,
            Self::Cancelled { .. } => WorkItemStatus::Cancelled,
            Self::ReworkRequested { .. } | Self::HitlRejected { .. } => WorkItemStatus::Rework,
            Self::Reverted { target, .. } => *target,
        }
    }
}

impl DomainEvent {
    /// Short event name stored in the event log.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// Encode this event for the `event_data` column of the event log.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn to_json(&self) -> Result<Value, EventError> {
        serde_json::to_value(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an event from its stored `(event_type, event_data)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] for malformed data and
    /// [`EventError::TypeMismatch`] when the stored type disagrees with the payload.
    pub fn from_record(event_type: &str, event_data: &Value) -> Result<Self, EventError> {
        let event: Self = serde_json::from_value(event_data.clone())
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;

        if event.event_type() != event_type {
            return Err(EventError::TypeMismatch {
                stored: event_type.to_string(),
                decoded: event.event_type().to_string(),
            });
        }

        Ok(event)
    }

    /// Payload published through the outbox for this event.
    ///
    /// `version` is the aggregate version after the event, which downstream
    /// consumers use (together with the idempotency key) to deduplicate.
    #[must_use]
    pub fn outbox_payload(&self, version: i64) -> Value {
        let mut payload = serde_json::Map::new();
        payload.insert("workitem_id".to_string(), Value::String(self.workitem_id.to_string()));
        payload.insert("tenant_id".to_string(), Value::String(self.tenant_id.clone()));
        payload.insert(
            "occurred_at".to_string(),
            Value::String(self.occurred_at.to_rfc3339()),
        );
        payload.insert("version".to_string(), Value::from(version));

        if let Ok(Value::Object(kind)) = serde_json::to_value(&self.kind) {
            for (key, value) in kind {
                if key != "type" {
                    payload.insert(key, value);
                }
            }
        }

        Value::Object(payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: WorkItemEventKind) -> DomainEvent {
        DomainEvent {
            workitem_id: Uuid::nil(),
            tenant_id: "t1".to_string(),
            occurred_at: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            kind,
        }
    }

    #[test]
    fn record_decoding_checks_event_type() {
        let started = event(WorkItemEventKind::Started);
        let data = started.to_json().unwrap();

        assert_eq!(DomainEvent::from_record("Started", &data).unwrap(), started);
        assert!(matches!(
            DomainEvent::from_record("Completed", &data),
            Err(EventError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn outbox_payload_flattens_kind_fields() {
        let submitted = event(WorkItemEventKind::Submitted {
            result: json!({"answer": 42}),
            verification: None,
        });

        let payload = submitted.outbox_payload(3);
        assert_eq!(payload["version"], json!(3));
        assert_eq!(payload["result"], json!({"answer": 42}));
        assert_eq!(payload["tenant_id"], json!("t1"));
        assert!(payload.get("type").is_none());
    }

    #[test]
    fn reverted_event_lands_on_its_target() {
        let kind = WorkItemEventKind::Reverted {
            reason: "undo".to_string(),
            target: WorkItemStatus::InProgress,
        };
        assert_eq!(kind.resulting_status(), WorkItemStatus::InProgress);
        assert_eq!(kind.outbox_event_type(), "WORKITEM_REVERTED");
    }
}
