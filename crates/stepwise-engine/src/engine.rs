use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwise_core::config::{EngineConfig, ModePreference};
use stepwise_core::types::{
    ExecutionEvent, ExecutionMode, ExecutionRecord, ExecutionStatus, OutputTable, Parameters,
    RunResult, Step,
};
use stepwise_core::{EventBus, PlanDocument};
use stepwise_tools::{decode_parameters, InvokeError, ToolInvoker};

use crate::aggregate::{aggregate, collect_errors};
use crate::error::EngineError;
use crate::orderer::{checked_order, find_cycle, sort_steps};
use crate::resolver::{resolve_parameters, unresolved_references};

/// A plan submitted for execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub plan: String,
    pub steps: Vec<Step>,
    /// Planner-supplied order. Its presence selects chained mode; the steps
    /// are still executed in input order.
    #[serde(default, alias = "executionOrder")]
    pub order: Option<Vec<String>>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl RunRequest {
    pub fn new(plan: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan: plan.into(),
            steps,
            order: None,
            mode: None,
            request_id: None,
            plan_id: None,
        }
    }

    pub fn with_order(mut self, order: Vec<String>) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_ids(mut self, request_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self.plan_id = Some(plan_id.into());
        self
    }
}

impl From<PlanDocument> for RunRequest {
    fn from(doc: PlanDocument) -> Self {
        Self::new(doc.plan, doc.steps).with_order(doc.execution_order)
    }
}

/// Phases a run moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Prepared,
    Running,
    Aggregated,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepared => f.write_str("prepared"),
            Self::Running => f.write_str("running"),
            Self::Aggregated => f.write_str("aggregated"),
        }
    }
}

struct PreparedStep {
    record: ExecutionRecord,
    /// Set when the step's parameters could not be decoded.
    invalid: Option<InvokeError>,
}

/// Runs plans against a tool invoker.
///
/// The engine holds no per-run state, so one instance can serve any number
/// of concurrent runs.
pub struct ExecutionEngine {
    invoker: ToolInvoker,
    default_mode: ModePreference,
    max_concurrency: Option<usize>,
    event_bus: Option<Arc<EventBus>>,
}

impl ExecutionEngine {
    pub fn new(invoker: ToolInvoker) -> Self {
        Self {
            invoker,
            default_mode: ModePreference::Auto,
            max_concurrency: None,
            event_bus: None,
        }
    }

    /// Build an engine with the `[engine]` settings applied.
    pub fn from_config(invoker: ToolInvoker, config: &EngineConfig) -> Self {
        Self {
            invoker: invoker.with_timeout(config.step_timeout()),
            default_mode: config.mode,
            max_concurrency: config.concurrency_limit(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_default_mode(mut self, mode: ModePreference) -> Self {
        self.default_mode = mode;
        self
    }

    /// Cap concurrent tool calls in parallel mode. `None` or `Some(0)` removes the cap.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit.filter(|n| *n > 0);
        self
    }

    /// Mode a request will run in.
    ///
    /// An explicit request mode wins, then a forced configured mode. Otherwise
    /// a plan with an order, a dependency, or a reference runs chained.
    pub fn select_mode(&self, request: &RunRequest) -> ExecutionMode {
        if let Some(mode) = request.mode {
            return mode;
        }
        if let Some(mode) = self.default_mode.forced() {
            return mode;
        }
        let needs_chaining = request.order.is_some()
            || request
                .steps
                .iter()
                .any(|s| s.depends_on.is_some() || s.has_references());
        if needs_chaining {
            ExecutionMode::Chained
        } else {
            ExecutionMode::Parallel
        }
    }

    /// Execute a plan to completion.
    pub async fn invoke(&self, request: RunRequest) -> Result<RunResult, EngineError> {
        self.invoke_with_cancel(request, CancellationToken::new()).await
    }

    /// Execute a plan, stopping early if `cancel` fires.
    ///
    /// Steps interrupted by cancellation, and chained steps not yet started,
    /// are recorded as failed with the message `cancelled`.
    pub async fn invoke_with_cancel(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        validate(&request)?;

        let mode = self.select_mode(&request);
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let prepared = prepare(&request.steps);
        self.enter_phase(&run_id, RunPhase::Prepared);
        self.publish(ExecutionEvent::RunStarted {
            run_id: run_id.clone(),
            mode,
            steps: prepared.len(),
        });

        self.enter_phase(&run_id, RunPhase::Running);
        let (executions, previous_outputs) = match mode {
            ExecutionMode::Parallel => (self.run_parallel(prepared, &run_id, &cancel).await, None),
            ExecutionMode::Chained => {
                let (records, outputs) = self.run_chained(prepared, &run_id, &cancel).await;
                (records, Some(outputs))
            }
        };

        let summary = aggregate(&executions);
        let errors = collect_errors(&executions);
        self.enter_phase(&run_id, RunPhase::Aggregated);
        info!(
            run_id = %run_id,
            %mode,
            total = summary.total_executions,
            successful = summary.successful,
            failed = summary.failed,
            "Plan run finished"
        );
        self.publish(ExecutionEvent::RunCompleted {
            run_id: run_id.clone(),
            summary: summary.clone(),
        });

        Ok(RunResult {
            run_id,
            request_id: request.request_id,
            plan_id: request.plan_id,
            plan: request.plan,
            mode,
            executions,
            results: summary,
            errors,
            previous_outputs,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Order steps by their dependencies, then run them chained.
    pub async fn run_plan(
        &self,
        plan: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<RunResult, EngineError> {
        let order = checked_order(&steps)?;
        let sorted = sort_steps(&steps, &order);
        let request = RunRequest::new(plan, sorted)
            .with_order(order)
            .with_mode(ExecutionMode::Chained);
        self.invoke(request).await
    }

    async fn run_parallel(
        &self,
        prepared: Vec<PreparedStep>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Vec<ExecutionRecord> {
        let calls: Vec<_> = prepared
            .into_iter()
            .map(|step| self.execute_step(step, run_id, cancel))
            .collect();

        match self.max_concurrency {
            Some(limit) => stream::iter(calls).buffered(limit).collect().await,
            None => join_all(calls).await,
        }
    }

    async fn run_chained(
        &self,
        prepared: Vec<PreparedStep>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> (Vec<ExecutionRecord>, OutputTable) {
        let mut outputs = OutputTable::new();
        let mut records = Vec::with_capacity(prepared.len());

        for mut step in prepared {
            if step.invalid.is_none() {
                step.record.parameters = resolve_parameters(&step.record.parameters, &outputs);
                for (key, reference) in unresolved_references(&step.record.parameters) {
                    warn!(
                        run_id,
                        tool = %step.record.tool_name,
                        parameter = key,
                        reference = %reference,
                        "No output recorded for reference, sending it as written"
                    );
                }
            }

            let record = self.execute_step(step, run_id, cancel).await;
            if record.status == ExecutionStatus::Completed {
                outputs.insert(
                    record.tool_name.clone(),
                    record.result.clone().unwrap_or_default(),
                );
            }
            records.push(record);
        }

        (records, outputs)
    }

    async fn execute_step(
        &self,
        step: PreparedStep,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        let PreparedStep { mut record, invalid } = step;

        let outcome = match invalid {
            Some(err) => Err(err),
            None if cancel.is_cancelled() => Err(InvokeError::Cancelled),
            None => {
                self.publish(ExecutionEvent::StepStarted {
                    run_id: run_id.to_string(),
                    tool: record.tool_name.clone(),
                });
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(InvokeError::Cancelled),
                    result = self.invoker.invoke(&record.tool_name, &record.parameters) => result,
                }
            }
        };

        match outcome {
            Ok(output) => {
                debug!(run_id, tool = %record.tool_name, "Step completed");
                record.complete(output);
                self.publish(ExecutionEvent::StepCompleted {
                    run_id: run_id.to_string(),
                    tool: record.tool_name.clone(),
                });
            }
            Err(e) => {
                let message = e.to_string();
                warn!(run_id, tool = %record.tool_name, error = %message, "Step failed");
                record.fail(message.clone());
                self.publish(ExecutionEvent::StepFailed {
                    run_id: run_id.to_string(),
                    tool: record.tool_name.clone(),
                    error: message,
                });
            }
        }
        record
    }

    fn enter_phase(&self, run_id: &str, phase: RunPhase) {
        info!(run_id, %phase, "Plan run phase");
    }

    fn publish(&self, event: ExecutionEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}

/// Reject plans that cannot run.
fn validate(request: &RunRequest) -> Result<(), EngineError> {
    let mut names = HashSet::with_capacity(request.steps.len());
    for (index, step) in request.steps.iter().enumerate() {
        if step.tool_name.trim().is_empty() {
            return Err(EngineError::EmptyToolName { index });
        }
        if !names.insert(step.tool_name.as_str()) {
            return Err(EngineError::DuplicateTool(step.tool_name.clone()));
        }
    }

    if let Some(order) = &request.order {
        if let Some(unknown) = order.iter().find(|n| !names.contains(n.as_str())) {
            return Err(EngineError::UnknownOrderEntry(unknown.clone()));
        }
    }

    if let Some(cycle) = find_cycle(&request.steps) {
        return Err(EngineError::CyclicDependency(cycle));
    }
    Ok(())
}

/// One pending record per step, in input order.
fn prepare(steps: &[Step]) -> Vec<PreparedStep> {
    steps
        .iter()
        .map(|step| match decode_parameters(step) {
            Ok(params) => PreparedStep {
                record: ExecutionRecord::pending(&step.tool_name, params),
                invalid: None,
            },
            Err(e) => PreparedStep {
                record: ExecutionRecord::pending(&step.tool_name, Parameters::new()),
                invalid: Some(e),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_test_utils::{blog_tools, MockToolProvider};
    use stepwise_tools::ToolCatalog;

    fn engine() -> ExecutionEngine {
        let catalog = Arc::new(ToolCatalog::from_definitions(blog_tools()));
        ExecutionEngine::new(ToolInvoker::new(catalog, Arc::new(MockToolProvider::new())))
    }

    #[test]
    fn test_mode_parallel_for_independent_literals() {
        let request = RunRequest::new("p", vec![Step::new("listBlogs"), Step::new("listAuthors")]);
        assert_eq!(engine().select_mode(&request), ExecutionMode::Parallel);
    }

    #[test]
    fn test_mode_chained_for_references_dependencies_or_order() {
        let e = engine();
        let with_ref = RunRequest::new(
            "p",
            vec![Step::new("getAuthor").with_param("id", "{{createAuthor._id}}")],
        );
        assert_eq!(e.select_mode(&with_ref), ExecutionMode::Chained);

        let with_dep = RunRequest::new("p", vec![Step::new("b").after("a"), Step::new("a")]);
        assert_eq!(e.select_mode(&with_dep), ExecutionMode::Chained);

        let with_order = RunRequest::new("p", vec![Step::new("listBlogs")])
            .with_order(vec!["listBlogs".into()]);
        assert_eq!(e.select_mode(&with_order), ExecutionMode::Chained);
    }

    #[test]
    fn test_mode_explicit_and_configured() {
        let request = RunRequest::new("p", vec![Step::new("b").after("a"), Step::new("a")]);
        assert_eq!(
            engine().select_mode(&request.clone().with_mode(ExecutionMode::Parallel)),
            ExecutionMode::Parallel
        );
        let forced = engine().with_default_mode(ModePreference::Chained);
        assert_eq!(
            forced.select_mode(&RunRequest::new("p", vec![Step::new("listBlogs")])),
            ExecutionMode::Chained
        );
    }

    #[test]
    fn test_validate_rejections() {
        let empty_name = RunRequest::new("p", vec![Step::new("listBlogs"), Step::new(" ")]);
        assert_eq!(validate(&empty_name), Err(EngineError::EmptyToolName { index: 1 }));

        let dup = RunRequest::new("p", vec![Step::new("listBlogs"), Step::new("listBlogs")]);
        assert_eq!(validate(&dup), Err(EngineError::DuplicateTool("listBlogs".into())));

        let unknown = RunRequest::new("p", vec![Step::new("listBlogs")])
            .with_order(vec!["listBlogs".into(), "getBlog".into()]);
        assert_eq!(validate(&unknown), Err(EngineError::UnknownOrderEntry("getBlog".into())));

        let cyclic = RunRequest::new("p", vec![Step::new("a").after("b"), Step::new("b").after("a")]);
        assert!(matches!(validate(&cyclic), Err(EngineError::CyclicDependency(_))));

        assert!(validate(&RunRequest::new("p", Vec::new())).is_ok());
    }

    #[test]
    fn test_request_wire_format() {
        let request: RunRequest = serde_json::from_value(json!({
            "plan": "Create an author",
            "steps": [{"toolName": "createAuthor", "parameters": {"name": "Bob"}}],
            "executionOrder": ["createAuthor"],
            "requestId": "req_1"
        }))
        .unwrap();
        assert_eq!(request.order.as_deref(), Some(&["createAuthor".to_string()][..]));
        assert_eq!(request.request_id.as_deref(), Some("req_1"));
        assert!(request.mode.is_none());
    }

    #[test]
    fn test_from_plan_document() {
        let doc = PlanDocument::parse(
            r#"{"plan": "x", "tools": [{"name": "listBlogs"}], "executionOrder": ["listBlogs"]}"#,
        )
        .unwrap();
        let request = RunRequest::from(doc);
        assert_eq!(request.steps.len(), 1);
        assert_eq!(engine().select_mode(&request), ExecutionMode::Chained);
    }

    #[tokio::test]
    async fn empty_plan_yields_empty_summary() {
        let result = engine().invoke(RunRequest::new("nothing", Vec::new())).await.unwrap();
        assert_eq!(result.results.total_executions, 0);
        assert!(result.errors.is_empty());
        assert_eq!(result.mode, ExecutionMode::Parallel);
    }
}
