//! Saga orchestrator: sequential steps with reverse-order compensation.
//!
//! [`SagaOrchestrator::execute`] runs steps strictly in order. Each step reads the
//! shared [`SagaContext`] and returns fields to merge into it, so later steps can
//! depend on what earlier steps produced.
//!
//! When a step fails (returns an error or panics), every step that already
//! completed is compensated in reverse order of completion. The failing step is
//! not compensated. A compensation failure is logged and recorded as
//! [`StepStatus::CompensationFailed`], and the remaining compensations still run.
//!
//! Failures are reported in the [`SagaResult`], never propagated: the caller
//! inspects [`SagaResult::success`].
//!
//! # Example
//!
//! ```
//! use relayflow_core::saga::{FnStep, SagaContext, SagaOrchestrator, SagaStep};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let steps: Vec<Arc<dyn SagaStep>> = vec![Arc::new(FnStep::new(
//!     "reserve",
//!     |_ctx| Box::pin(async {
//!         let mut out = SagaContext::new();
//!         out.insert("reservation".to_string(), json!("r-1"));
//!         Ok(out)
//!     }),
//!     |_ctx| Box::pin(async { Ok(()) }),
//! ))];
//!
//! let result = SagaOrchestrator::new("demo").execute(&steps, SagaContext::new()).await;
//! assert!(result.success);
//! assert_eq!(result.context["reservation"], json!("r-1"));
//! # });
//! ```

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Shared saga context: a JSON object steps read from and add to.
pub type SagaContext = Map<String, Value>;

/// One step of a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name, reported in the result.
    fn name(&self) -> &str;

    /// Do the work. Returned fields are merged into the context.
    ///
    /// # Errors
    ///
    /// Any error fails the saga and triggers compensation of earlier steps.
    async fn execute(&self, context: &SagaContext) -> anyhow::Result<SagaContext>;

    /// Undo the work, given the context as it stood when the saga failed.
    ///
    /// # Errors
    ///
    /// An error is recorded; remaining compensations still run.
    async fn compensate(&self, context: &SagaContext) -> anyhow::Result<()>;
}

type ExecuteFn = dyn Fn(SagaContext) -> BoxFuture<'static, anyhow::Result<SagaContext>> + Send + Sync;
type CompensateFn = dyn Fn(SagaContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A step built from two closures.
pub struct FnStep {
    name: String,
    execute: Box<ExecuteFn>,
    compensate: Box<CompensateFn>,
}

impl FnStep {
    /// Create a step. Closures receive an owned copy of the context.
    pub fn new<E, C>(name: impl Into<String>, execute: E, compensate: C) -> Self
    where
        E: Fn(SagaContext) -> BoxFuture<'static, anyhow::Result<SagaContext>> + Send + Sync + 'static,
        C: Fn(SagaContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(execute),
            compensate: Box::new(compensate),
        }
    }
}

impl std::fmt::Debug for FnStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl SagaStep for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &SagaContext) -> anyhow::Result<SagaContext> {
        (self.execute)(context.clone()).await
    }

    async fn compensate(&self, context: &SagaContext) -> anyhow::Result<()> {
        (self.compensate)(context.clone()).await
    }
}

/// Terminal status of a step in a saga run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Executed successfully and was not rolled back.
    Completed,
    /// Its execution failed the saga.
    Failed,
    /// Executed, then rolled back.
    Compensated,
    /// Executed, then its compensation failed.
    CompensationFailed,
}

/// Log entry for one step that ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name.
    pub name: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Execution or compensation error.
    pub error: Option<String>,
}

/// Outcome of a saga run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SagaResult {
    /// Whether every step completed.
    pub success: bool,
    /// Name of the step that failed.
    pub failed_step: Option<String>,
    /// Why it failed.
    pub reason: Option<String>,
    /// Context after the last merge.
    pub context: SagaContext,
    /// Steps that ran, in execution order.
    pub steps: Vec<StepRecord>,
}

/// Runs sagas.
#[derive(Clone, Debug)]
pub struct SagaOrchestrator {
    name: String,
}

impl SagaOrchestrator {
    /// Create an orchestrator; `name` tags its log lines.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Run `steps` in order from `initial`, compensating on failure.
    pub async fn execute(&self, steps: &[Arc<dyn SagaStep>], initial: SagaContext) -> SagaResult {
        let mut context = initial;
        let mut records: Vec<StepRecord> = Vec::with_capacity(steps.len());

        tracing::info!(saga = %self.name, steps = steps.len(), "Saga started");

        for (index, step) in steps.iter().enumerate() {
            let outcome = AssertUnwindSafe(step.execute(&context))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(&*panic))));

            match outcome {
                Ok(produced) => {
                    context.extend(produced);
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        status: StepStatus::Completed,
                        error: None,
                    });
                },
                Err(error) => {
                    let reason = format!("{error:#}");
                    tracing::warn!(
                        saga = %self.name,
                        step = step.name(),
                        error = %reason,
                        "Saga step failed, compensating"
                    );
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        status: StepStatus::Failed,
                        error: Some(reason.clone()),
                    });

                    self.compensate(&steps[..index], &mut records, &context).await;

                    return SagaResult {
                        success: false,
                        failed_step: Some(step.name().to_string()),
                        reason: Some(reason),
                        context,
                        steps: records,
                    };
                },
            }
        }

        tracing::info!(saga = %self.name, "Saga completed");

        SagaResult {
            success: true,
            failed_step: None,
            reason: None,
            context,
            steps: records,
        }
    }

    /// Compensate `completed` (all executed successfully) newest first.
    /// `records[i]` is the log entry of `completed[i]`.
    async fn compensate(
        &self,
        completed: &[Arc<dyn SagaStep>],
        records: &mut [StepRecord],
        context: &SagaContext,
    ) {
        for (index, step) in completed.iter().enumerate().rev() {
            let outcome = AssertUnwindSafe(step.compensate(context))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(&*panic))));

            let record = &mut records[index];
            match outcome {
                Ok(()) => {
                    tracing::debug!(saga = %self.name, step = step.name(), "Step compensated");
                    record.status = StepStatus::Compensated;
                },
                Err(error) => {
                    tracing::error!(
                        saga = %self.name,
                        step = step.name(),
                        error = %format!("{error:#}"),
                        "Compensation failed"
                    );
                    record.status = StepStatus::CompensationFailed;
                    record.error = Some(format!("{error:#}"));
                },
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(|| "step panicked".to_string(), |msg| format!("step panicked: {msg}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn step(name: &'static str, fails: bool, journal: &Journal) -> Arc<dyn SagaStep> {
        let exec_journal = Arc::clone(journal);
        let comp_journal = Arc::clone(journal);
        Arc::new(FnStep::new(
            name,
            move |_ctx| {
                let journal = Arc::clone(&exec_journal);
                Box::pin(async move {
                    journal.lock().unwrap().push(format!("exec {name}"));
                    if fails {
                        anyhow::bail!("{name} exploded");
                    }
                    let mut out = SagaContext::new();
                    out.insert(name.to_string(), json!(true));
                    Ok(out)
                })
            },
            move |_ctx| {
                let journal = Arc::clone(&comp_journal);
                Box::pin(async move {
                    journal.lock().unwrap().push(format!("undo {name}"));
                    Ok(())
                })
            },
        ))
    }

    #[tokio::test]
    async fn failure_compensates_completed_steps_in_reverse() {
        let journal = Journal::default();
        let steps = vec![
            step("A", false, &journal),
            step("B", false, &journal),
            step("C", true, &journal),
        ];

        let result = SagaOrchestrator::new("t").execute(&steps, SagaContext::new()).await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("C"));
        assert!(result.reason.unwrap().contains("C exploded"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["exec A", "exec B", "exec C", "undo B", "undo A"]
        );
        let statuses: Vec<_> = result.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Compensated, StepStatus::Compensated, StepStatus::Failed]
        );
    }

    #[tokio::test]
    async fn empty_saga_succeeds() {
        let result = SagaOrchestrator::new("t").execute(&[], SagaContext::new()).await;
        assert!(result.success);
        assert!(result.steps.is_empty());
        assert!(result.failed_step.is_none());
    }

    #[tokio::test]
    async fn later_steps_see_earlier_additions() {
        let journal = Journal::default();
        let reader: Arc<dyn SagaStep> = Arc::new(FnStep::new(
            "reader",
            |ctx| {
                Box::pin(async move {
                    let mut out = SagaContext::new();
                    out.insert("saw_a".to_string(), json!(ctx.contains_key("A")));
                    Ok(out)
                })
            },
            |_ctx| Box::pin(async { Ok(()) }),
        ));
        let steps = vec![step("A", false, &journal), reader];

        let result = SagaOrchestrator::new("t").execute(&steps, SagaContext::new()).await;
        assert!(result.success);
        assert_eq!(result.context["saw_a"], json!(true));
    }

    #[tokio::test]
    async fn compensation_failure_does_not_stop_rollback() {
        let journal = Journal::default();
        let broken_undo: Arc<dyn SagaStep> = Arc::new(FnStep::new(
            "B",
            |_ctx| Box::pin(async { Ok(SagaContext::new()) }),
            |_ctx| Box::pin(async { anyhow::bail!("cannot undo") }),
        ));
        let steps = vec![step("A", false, &journal), broken_undo, step("C", true, &journal)];

        let result = SagaOrchestrator::new("t").execute(&steps, SagaContext::new()).await;

        assert_eq!(result.steps[1].status, StepStatus::CompensationFailed);
        assert_eq!(result.steps[0].status, StepStatus::Compensated);
        assert!(journal.lock().unwrap().contains(&"undo A".to_string()));
    }

    async fn explode(_ctx: SagaContext) -> anyhow::Result<SagaContext> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_step_is_reported_as_failure() {
        let journal = Journal::default();
        let panicky: Arc<dyn SagaStep> = Arc::new(FnStep::new(
            "P",
            |ctx| Box::pin(explode(ctx)),
            |_ctx| Box::pin(async { Ok(()) }),
        ));
        let steps = vec![step("A", false, &journal), panicky];

        let result = SagaOrchestrator::new("t").execute(&steps, SagaContext::new()).await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("P"));
        assert!(result.reason.unwrap().contains("boom"));
        assert_eq!(result.steps[0].status, StepStatus::Compensated);
    }
}
