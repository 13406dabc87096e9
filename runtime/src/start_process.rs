//! The "start process" saga.
//!
//! Three steps, compensated in reverse on failure:
//!
//! | Step | Adds to context | Compensation |
//! |------|-----------------|--------------|
//! | `create_process_instance` | `proc_instance_id` | delete the role bindings |
//! | `create_initial_workitem` | `workitem_id` | force-cancel the WorkItem |
//! | `publish_process_initiated` | `event_id` | none: published events are superseded, not undone |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use relayflow_core::environment::Clock;
use relayflow_core::outbox::OutboxStore;
use relayflow_core::publisher::{EventPublisher, PublishRequest};
use relayflow_core::saga::{SagaContext, SagaOrchestrator, SagaResult, SagaStep};
use relayflow_core::workitem::{AgentMode, NewWorkItem};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::service::WorkItemService;

/// Aggregate type recorded on process outbox rows.
pub const PROCESS_AGGREGATE_TYPE: &str = "Process";

/// Context key of the created process instance id.
pub const PROC_INSTANCE_ID: &str = "proc_instance_id";

/// Context key of the created WorkItem id.
pub const WORKITEM_ID: &str = "workitem_id";

/// Context key of the published outbox row id.
pub const EVENT_ID: &str = "event_id";

/// A principal bound to a process role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    /// Role name.
    pub role: String,
    /// Bound principal.
    pub principal_id: String,
}

/// A running process instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Instance id.
    pub id: Uuid,
    /// Process definition it instantiates.
    pub definition_id: String,
    /// Display name.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Who started it.
    pub initiator_id: Option<String>,
    /// Start input.
    pub input: Value,
    /// Start time.
    pub started_at: DateTime<Utc>,
}

/// Process instances and their role bindings, owned by another service.
pub trait ProcessRegistry: Send + Sync {
    /// Persist a new instance.
    ///
    /// # Errors
    ///
    /// Any failure fails the saga step.
    fn create_instance<'a>(&'a self, instance: &'a ProcessInstance) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Bind principals to roles of an instance.
    ///
    /// # Errors
    ///
    /// Any failure fails the saga step.
    fn bind_roles<'a>(
        &'a self,
        instance_id: Uuid,
        bindings: &'a [RoleBinding],
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Remove every role binding of an instance.
    ///
    /// # Errors
    ///
    /// Any failure is recorded as a compensation failure.
    fn delete_role_bindings(&self, instance_id: Uuid) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// The first activity of the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialActivity {
    /// Activity name.
    pub name: String,
    /// Activity category.
    pub activity_type: String,
    /// Assigned principal.
    pub assignee_id: Option<String>,
    /// Who performs the work.
    #[serde(default)]
    pub agent_mode: AgentMode,
}

/// Input of [`StartProcess::run`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartProcessRequest {
    /// Process definition to instantiate.
    pub definition_id: String,
    /// Display name.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Who starts it.
    pub initiator_id: Option<String>,
    /// Role bindings.
    #[serde(default)]
    pub role_bindings: Vec<RoleBinding>,
    /// First activity.
    pub initial_activity: InitialActivity,
    /// Start input.
    #[serde(default)]
    pub input: Value,
}

/// Wires and runs the start-process saga.
#[derive(Clone)]
pub struct StartProcess {
    registry: Arc<dyn ProcessRegistry>,
    workitems: WorkItemService,
    outbox: Arc<dyn OutboxStore>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
}

impl StartProcess {
    /// Create the saga.
    #[must_use]
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        workitems: WorkItemService,
        outbox: Arc<dyn OutboxStore>,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            workitems,
            outbox,
            publisher,
            clock,
        }
    }

    /// The three steps for one request.
    #[must_use]
    pub fn steps(&self, request: &StartProcessRequest) -> Vec<Arc<dyn SagaStep>> {
        let request = Arc::new(request.clone());
        vec![
            Arc::new(CreateProcessInstance {
                registry: Arc::clone(&self.registry),
                clock: Arc::clone(&self.clock),
                request: Arc::clone(&request),
            }),
            Arc::new(CreateInitialWorkItem {
                workitems: self.workitems.clone(),
                request: Arc::clone(&request),
            }),
            Arc::new(PublishProcessInitiated {
                outbox: Arc::clone(&self.outbox),
                publisher: self.publisher.clone(),
                clock: Arc::clone(&self.clock),
                request,
            }),
        ]
    }

    /// Run the saga. Inspect [`SagaResult::success`]; failures are not errors.
    pub async fn run(&self, request: &StartProcessRequest) -> SagaResult {
        let steps = self.steps(request);
        let mut initial = SagaContext::new();
        initial.insert("tenant_id".to_string(), json!(request.tenant_id));
        initial.insert("definition_id".to_string(), json!(request.definition_id));

        SagaOrchestrator::new("start_process")
            .execute(&steps, initial)
            .await
    }
}

fn context_uuid(context: &SagaContext, key: &str) -> anyhow::Result<Uuid> {
    let raw = context
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("saga context has no {key}"))?;
    Ok(Uuid::parse_str(raw)?)
}

struct CreateProcessInstance {
    registry: Arc<dyn ProcessRegistry>,
    clock: Arc<dyn Clock>,
    request: Arc<StartProcessRequest>,
}

#[async_trait]
impl SagaStep for CreateProcessInstance {
    fn name(&self) -> &str {
        "create_process_instance"
    }

    async fn execute(&self, _context: &SagaContext) -> anyhow::Result<SagaContext> {
        let instance = ProcessInstance {
            id: Uuid::new_v4(),
            definition_id: self.request.definition_id.clone(),
            name: self.request.name.clone(),
            tenant_id: self.request.tenant_id.clone(),
            initiator_id: self.request.initiator_id.clone(),
            input: self.request.input.clone(),
            started_at: self.clock.now(),
        };

        self.registry.create_instance(&instance).await?;
        self.registry
            .bind_roles(instance.id, &self.request.role_bindings)
            .await?;

        let mut out = SagaContext::new();
        out.insert(PROC_INSTANCE_ID.to_string(), json!(instance.id.to_string()));
        Ok(out)
    }

    async fn compensate(&self, context: &SagaContext) -> anyhow::Result<()> {
        let instance_id = context_uuid(context, PROC_INSTANCE_ID)?;
        self.registry.delete_role_bindings(instance_id).await
    }
}

struct CreateInitialWorkItem {
    workitems: WorkItemService,
    request: Arc<StartProcessRequest>,
}

#[async_trait]
impl SagaStep for CreateInitialWorkItem {
    fn name(&self) -> &str {
        "create_initial_workitem"
    }

    async fn execute(&self, context: &SagaContext) -> anyhow::Result<SagaContext> {
        let proc_instance_id = context_uuid(context, PROC_INSTANCE_ID)?;
        let activity = &self.request.initial_activity;

        let mut new = NewWorkItem::new(
            Uuid::new_v4(),
            activity.name.clone(),
            activity.activity_type.clone(),
            self.request.tenant_id.clone(),
        )
        .with_process(proc_instance_id)
        .with_agent_mode(activity.agent_mode);
        if let Some(assignee) = &activity.assignee_id {
            new = new.with_assignee(assignee.clone());
        }

        let item = self.workitems.create(new).await?;

        let mut out = SagaContext::new();
        out.insert(WORKITEM_ID.to_string(), json!(item.id().to_string()));
        Ok(out)
    }

    async fn compensate(&self, context: &SagaContext) -> anyhow::Result<()> {
        let workitem_id = context_uuid(context, WORKITEM_ID)?;
        self.workitems.force_cancel(workitem_id).await?;
        Ok(())
    }
}

struct PublishProcessInitiated {
    outbox: Arc<dyn OutboxStore>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    request: Arc<StartProcessRequest>,
}

#[async_trait]
impl SagaStep for PublishProcessInitiated {
    fn name(&self) -> &str {
        "publish_process_initiated"
    }

    async fn execute(&self, context: &SagaContext) -> anyhow::Result<SagaContext> {
        let proc_instance_id = context_uuid(context, PROC_INSTANCE_ID)?;
        let workitem_id = context_uuid(context, WORKITEM_ID)?;

        let payload = json!({
            "proc_instance_id": proc_instance_id.to_string(),
            "definition_id": self.request.definition_id,
            "name": self.request.name,
            "initiator_id": self.request.initiator_id,
            "initial_workitem_id": workitem_id.to_string(),
            "tenant_id": self.request.tenant_id,
        });

        let mut unit = self.outbox.begin().await?;
        let entry = self
            .publisher
            .publish(
                unit.as_mut(),
                PublishRequest::new(
                    "PROCESS_INITIATED",
                    PROCESS_AGGREGATE_TYPE,
                    proc_instance_id.to_string(),
                    payload,
                    self.request.tenant_id.clone(),
                ),
                self.clock.now(),
            )
            .await?;
        unit.commit().await?;

        let mut out = SagaContext::new();
        out.insert(EVENT_ID.to_string(), json!(entry.id.to_string()));
        Ok(out)
    }

    async fn compensate(&self, _context: &SagaContext) -> anyhow::Result<()> {
        Ok(())
    }
}
