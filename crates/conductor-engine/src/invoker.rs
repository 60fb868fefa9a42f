use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use conductor_core::definition::{ExecutorKind, StepSpec};
use conductor_core::error::{ConductorError, ErrorDetail, ErrorKind, Result};
use conductor_core::expr::evaluate_condition;
use conductor_core::types::{ExecutorOutput, InvocationContext, RunStatus};

use crate::context::ExecutionContext;
use crate::controller::{stage_timeout, StageController};
use crate::engine::Engine;
use crate::mapping::render_objective;
use crate::react::ReActAgent;
use crate::scratchpad::Scratchpad;

/// Normalized outcome of invoking one stage.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub output: Value,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error: Option<ErrorDetail>,
    pub cost: f64,
    pub log: Vec<String>,
}

impl StepResult {
    pub fn completed(output: Value, cost: f64) -> Self {
        Self {
            output,
            success: true,
            error_kind: None,
            error_message: None,
            error: None,
            cost,
            log: Vec::new(),
        }
    }

    pub fn failed(error: ErrorDetail) -> Self {
        Self {
            output: Value::Null,
            success: false,
            error_kind: Some(error.kind),
            error_message: Some(error.message.clone()),
            error: Some(error),
            cost: 0.0,
            log: Vec::new(),
        }
    }

    pub fn with_log(mut self, log: Vec<String>) -> Self {
        self.log = log;
        self
    }
}

/// Uniform call boundary between a stage and whatever executes it.
pub struct StepInvoker {
    engine: Arc<Engine>,
}

impl StepInvoker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Invoke a stage once with its resolved input. Never fails; errors are
    /// captured in the result along with the stage's log lines.
    pub async fn invoke(
        &self,
        stage: &StepSpec,
        input: Value,
        ctx: &ExecutionContext,
        attempt: u32,
    ) -> StepResult {
        let result = match self.dispatch(stage, input, ctx, attempt).await {
            Ok((output, cost)) => StepResult::completed(output, cost),
            Err(e) => {
                debug!(run_id = %ctx.run_id(), stage = %stage.id, attempt, error = %e, "Stage invocation failed");
                StepResult::failed(
                    e.to_detail()
                        .with_run(ctx.run_id().to_string())
                        .with_stage(stage.id.clone()),
                )
            }
        };
        result.with_log(ctx.take_logs(&stage.id))
    }

    async fn dispatch(
        &self,
        stage: &StepSpec,
        input: Value,
        ctx: &ExecutionContext,
        attempt: u32,
    ) -> Result<(Value, f64)> {
        match stage.kind {
            ExecutorKind::Tool | ExecutorKind::Adapter => {
                self.call_executor(stage, input, ctx, attempt).await
            }
            ExecutorKind::Orchestrator => self.run_nested(stage, input, ctx).await,
            ExecutorKind::Agent => self.run_agent(stage, input, ctx).await,
            ExecutorKind::Condition => {
                let expression =
                    stage
                        .expression
                        .as_deref()
                        .ok_or_else(|| ConductorError::InvalidParameters {
                            stage: stage.id.clone(),
                            reason: "condition stage has no expression".into(),
                        })?;
                let mut scope = ctx.scope();
                scope["input"] = input;
                let result = evaluate_condition(expression, &scope)?;
                ctx.log(&stage.id, format!("'{expression}' evaluated {result}"));
                Ok((json!({ "result": result }), 0.0))
            }
            ExecutorKind::Manual => {
                ctx.log(&stage.id, "manual stage forwarded its input");
                Ok((input, 0.0))
            }
        }
    }

    async fn call_executor(
        &self,
        stage: &StepSpec,
        input: Value,
        ctx: &ExecutionContext,
        attempt: u32,
    ) -> Result<(Value, f64)> {
        if stage.executor.trim().is_empty() {
            return Err(ConductorError::NoExecutorConfigured {
                stage: stage.id.clone(),
            });
        }
        let invocation = InvocationContext {
            run_id: ctx.run_id().clone(),
            stage_id: stage.id.clone(),
            attempt,
            working_dir: ctx.working_dir().clone(),
        };
        let out = match self
            .engine
            .registry()
            .execute(stage.kind, &stage.executor, input, invocation)
            .await
        {
            Ok(out) => out,
            Err(e) => {
                ctx.log(
                    &stage.id,
                    format!("{} '{}' attempt {attempt}: error: {e}", stage.kind, stage.executor),
                );
                return Err(e);
            }
        };
        ctx.log(
            &stage.id,
            format!(
                "{} '{}' attempt {attempt}: {}",
                stage.kind,
                stage.executor,
                if out.success { "ok" } else { "failed" }
            ),
        );
        if !out.success {
            return Err(ConductorError::ExecutorFailed {
                executor: stage.executor.clone(),
                message: out
                    .error_message
                    .unwrap_or_else(|| "executor reported failure".into()),
            });
        }
        Ok((out.output, out.cost))
    }

    /// Call a tool on behalf of an agent action.
    pub async fn invoke_tool(
        &self,
        tool: &str,
        input: Value,
        ctx: &ExecutionContext,
        stage_id: &str,
        cycle: u32,
    ) -> Result<ExecutorOutput> {
        let invocation = InvocationContext {
            run_id: ctx.run_id().clone(),
            stage_id: stage_id.to_string(),
            attempt: cycle,
            working_dir: ctx.working_dir().clone(),
        };
        self.engine
            .registry()
            .execute(ExecutorKind::Tool, tool, input, invocation)
            .await
    }

    async fn run_nested(
        &self,
        stage: &StepSpec,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<(Value, f64)> {
        let mut variables = if stage.inherit_variables {
            ctx.variables()
        } else {
            Map::new()
        };
        match input {
            Value::Object(map) => variables.extend(map),
            Value::Null => {}
            other => {
                variables.insert("input".into(), other);
            }
        }

        let timeout = ctx
            .clamp_timeout(stage_timeout(self.engine.config(), stage))
            .unwrap_or_default();
        let started = Instant::now();
        let deadline = started + timeout;
        let cancel = ctx.cancel_token().child_token();

        let controller = StageController::new(self.engine.clone());
        let mut child_run =
            controller.run_child(&stage.executor, variables, ctx, cancel.clone(), Some(deadline));
        let (child, timed_out) = tokio::select! {
            result = &mut child_run => (result?, false),
            _ = tokio::time::sleep_until(deadline) => {
                // Stop the child at its next boundary and wait for its final record.
                cancel.cancel();
                (child_run.await?, true)
            }
        };
        ctx.log(
            &stage.id,
            format!("nested run {} finished {}", child.id, child.status),
        );

        if child.status != RunStatus::Completed && (timed_out || Instant::now() >= deadline) {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            warn!(run_id = %ctx.run_id(), stage = %stage.id, child = %child.id, elapsed_ms, "Nested run hit the stage deadline");
            return Err(ConductorError::Timeout {
                executor: stage.executor.clone(),
                timeout_ms: timeout.as_millis() as u64,
                elapsed_ms,
            });
        }

        match child.status {
            RunStatus::Completed => Ok((
                json!({
                    "run_id": child.id.to_string(),
                    "status": child.status,
                    "results": child.results,
                    "variables": child.variables,
                    "has_errors": child.has_errors(),
                }),
                child.total_cost,
            )),
            RunStatus::Cancelled => Err(ConductorError::Cancelled),
            _ => {
                let cause = child.errors.first().cloned().unwrap_or_else(|| {
                    ErrorDetail::new(ErrorKind::Internal, "nested run failed without detail")
                });
                Err(ConductorError::NestedRun {
                    child_run_id: child.id.to_string(),
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn run_agent(
        &self,
        stage: &StepSpec,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<(Value, f64)> {
        let spec = stage
            .agent
            .as_ref()
            .ok_or_else(|| ConductorError::InvalidParameters {
                stage: stage.id.clone(),
                reason: "agent stage has no agent configuration".into(),
            })?;
        let backend = self
            .engine
            .reasoner()
            .cloned()
            .ok_or_else(|| ConductorError::NoReasoningBackend(stage.id.clone()))?;

        let objective = render_objective(&spec.objective, &input, ctx);
        let config = &self.engine.config().agent;
        let agent = ReActAgent::new(backend.as_ref(), self, config)
            .with_tools(spec.tools.clone())
            .with_max_cycles(spec.max_cycles.unwrap_or(config.max_cycles));

        let mut pad = Scratchpad::new();
        let result = agent.run(&objective, &mut pad, ctx, &stage.id).await;
        for line in pad.log_lines() {
            ctx.log(&stage.id, line);
        }
        let answer = result?;

        Ok((
            json!({
                "answer": answer,
                "objective": objective,
                "cycles": pad.cycles(),
                "actions": pad.action_count(),
            }),
            pad.cost(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::config::EngineConfig;
    use conductor_core::definition::WorkflowDefinition;
    use conductor_core::types::RunId;
    use conductor_executors::ExecutorRegistry;
    use conductor_test_utils::{FailureMode, RecordingExecutor, ScriptedExecutor, ScriptedReasoner};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecutionContext {
        let mut vars = Map::new();
        vars.insert("threshold".into(), json!(10));
        ExecutionContext::new(RunId::from_str("r1"), vars, CancellationToken::new())
    }

    fn invoker_with(registry: ExecutorRegistry) -> StepInvoker {
        StepInvoker::new(Engine::builder(EngineConfig::default()).registry(registry).build())
    }

    #[tokio::test]
    async fn test_tool_dispatch_through_registry() {
        let mut registry = ExecutorRegistry::new();
        let recorder = RecordingExecutor::new("rec").with_cost(0.25);
        let calls = recorder.calls();
        registry.register(recorder);
        let invoker = invoker_with(registry);
        let ctx = ctx();

        let stage = StepSpec::tool("s", 1, "rec");
        let result = invoker.invoke(&stage, json!({"a": 1}), &ctx, 1).await;
        assert!(result.success);
        assert_eq!(result.output, json!({"a": 1}));
        assert!((result.cost - 0.25).abs() < f64::EPSILON);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(result.log, vec!["tool 'rec' attempt 1: ok"]);
    }

    #[tokio::test]
    async fn test_adapter_is_keyed_separately_from_tools() {
        let mut registry = ExecutorRegistry::new();
        registry.register(RecordingExecutor::new("crm").with_kind(ExecutorKind::Adapter));
        let invoker = invoker_with(registry);
        let ctx = ctx();

        let adapter = StepSpec::new("s", ExecutorKind::Adapter, 1).with_executor("crm");
        assert!(invoker.invoke(&adapter, json!({}), &ctx, 1).await.success);

        let tool = StepSpec::tool("t", 2, "crm");
        let result = invoker.invoke(&tool, json!({}), &ctx, 1).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
        assert!(result.error_message.unwrap().contains("Unsupported executor"));
    }

    #[tokio::test]
    async fn test_unsuccessful_output_is_transient_failure() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("flaky").failing(1).with_mode(FailureMode::Output));
        let invoker = invoker_with(registry);
        let result = invoker
            .invoke(&StepSpec::tool("s", 1, "flaky"), json!({}), &ctx(), 1)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Transient));
        let detail = result.error.unwrap();
        assert_eq!(detail.stage_id.as_deref(), Some("s"));
        assert_eq!(detail.run_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_condition_and_manual_stages() {
        let invoker = invoker_with(ExecutorRegistry::new());
        let ctx = ctx();

        let cond = StepSpec::new("c", ExecutorKind::Condition, 1)
            .with_expression("input.count > threshold");
        let result = invoker.invoke(&cond, json!({"count": 12}), &ctx, 1).await;
        assert_eq!(result.output, json!({"result": true}));

        let result = invoker.invoke(&cond, json!({"count": 3}), &ctx, 1).await;
        assert!(result.success);
        assert_eq!(result.output, json!({"result": false}));

        let manual = StepSpec::new("m", ExecutorKind::Manual, 2);
        let result = invoker.invoke(&manual, json!({"approved": true}), &ctx, 1).await;
        assert_eq!(result.output, json!({"approved": true}));
    }

    #[tokio::test]
    async fn test_agent_without_backend_is_configuration_error() {
        let invoker = invoker_with(ExecutorRegistry::new());
        let stage = StepSpec::agent_stage("ag", 1, "Do it");
        let result = invoker.invoke(&stage, json!({}), &ctx(), 1).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));

        let mut bare = StepSpec::new("ag2", ExecutorKind::Agent, 2);
        bare.agent = None;
        let result = invoker.invoke(&bare, json!({}), &ctx(), 1).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_agent_stage_returns_answer_and_log() {
        let engine = Engine::builder(EngineConfig::default())
            .registry(ExecutorRegistry::new())
            .reasoner(Arc::new(ScriptedReasoner::immediate("all good")))
            .build();
        let invoker = StepInvoker::new(engine);
        let stage = StepSpec::agent_stage("ag", 1, "Check {{thing}}");
        let result = invoker.invoke(&stage, json!({"thing": "status"}), &ctx(), 1).await;
        assert!(result.success);
        assert_eq!(result.output["answer"], json!("all good"));
        assert_eq!(result.output["objective"], json!("Check status"));
        assert_eq!(result.output["cycles"], json!(1));
        assert!(result.log.last().unwrap().contains("answered: all good"));
    }

    #[tokio::test]
    async fn test_nested_definition_must_exist() {
        let invoker = invoker_with(ExecutorRegistry::new());
        let stage = StepSpec::new("n", ExecutorKind::Orchestrator, 1).with_executor("missing");
        let result = invoker.invoke(&stage, json!({}), &ctx(), 1).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_nested_run_inherits_variables() {
        let engine = Engine::builder(EngineConfig::default())
            .registry(ExecutorRegistry::with_builtins())
            .build();
        engine
            .register_definition(
                WorkflowDefinition::new("child", "Child").with_stage(
                    StepSpec::tool("echo", 1, "echo")
                        .with_input("t", conductor_core::InputSource::variable("threshold"))
                        .with_output("seen", "t"),
                ),
            )
            .unwrap();
        let invoker = StepInvoker::new(engine);
        let stage = StepSpec::new("n", ExecutorKind::Orchestrator, 1).with_executor("child");
        let result = invoker.invoke(&stage, json!({"extra": 1}), &ctx(), 1).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output["status"], json!("completed"));
        assert_eq!(result.output["variables"]["seen"], json!(10));
        assert_eq!(result.output["variables"]["extra"], json!(1));
    }
}
