use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::config::{BackoffPolicy, EngineConfig};
use conductor_core::definition::{ExecutorKind, StepSpec, WorkflowDefinition};
use conductor_core::error::{ConductorError, ErrorDetail, ErrorKind, Result};
use conductor_core::expr::evaluate_condition;
use conductor_core::types::{RunExecution, RunStatus};
use conductor_llm::retry::calculate_backoff;

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::invoker::{StepInvoker, StepResult};
use crate::mapping::{apply_output, resolve_input};

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    Continue,
    Halt,
    Cancelled,
}

/// How a single stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Completed,
    Skipped,
    /// Failed but the run goes on.
    Tolerated,
    /// Failed and the run must stop.
    Halted,
    Cancelled,
    /// Never started because the phase was already halting.
    NotStarted,
}

/// Drives a workflow definition phase by phase.
///
/// Every run-state change goes through the tracker; the controller only
/// decides ordering, retries, and whether the run continues.
pub struct StageController {
    engine: Arc<Engine>,
    invoker: StepInvoker,
}

impl StageController {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            invoker: StepInvoker::new(engine.clone()),
            engine,
        }
    }

    /// Validate, begin, and run a definition to completion.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        variables: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunExecution> {
        definition.validate()?;
        let run = self
            .engine
            .tracker()
            .begin(definition, "controller", variables.clone(), None)
            .await?;
        let ctx = ExecutionContext::new(run.id, variables, cancel);
        self.execute_run(definition, &ctx).await
    }

    /// Run an already begun run. The context's run id must match a tracker
    /// record in the Pending state.
    pub async fn execute_run(
        &self,
        definition: &WorkflowDefinition,
        ctx: &ExecutionContext,
    ) -> Result<RunExecution> {
        let tracker = self.engine.tracker();
        let run_id = ctx.run_id();
        tracker.set_status(run_id, RunStatus::Running).await?;
        info!(run_id = %run_id, definition = %definition.id, depth = ctx.depth(), "Run started");

        let mut status = RunStatus::Completed;
        for (index, phase) in definition.phases().into_iter().enumerate() {
            if ctx.is_paused() {
                tracker.set_status(run_id, RunStatus::Paused).await?;
                info!(run_id = %run_id, phase = index, "Run paused");
                if !ctx.wait_while_paused().await {
                    status = RunStatus::Cancelled;
                    break;
                }
                tracker.set_status(run_id, RunStatus::Running).await?;
                info!(run_id = %run_id, phase = index, "Run resumed");
            }
            if ctx.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            debug!(run_id = %run_id, phase = index, stages = phase.len(), "Starting phase");
            match self.run_phase(&phase, ctx).await {
                PhaseOutcome::Continue => {}
                PhaseOutcome::Halt => {
                    status = RunStatus::Failed;
                    break;
                }
                PhaseOutcome::Cancelled => {
                    status = RunStatus::Cancelled;
                    break;
                }
            }
        }

        let run = tracker.complete(run_id, status, ctx.variables()).await?;
        match run.status {
            RunStatus::Completed if run.has_errors() => {
                warn!(run_id = %run_id, errors = run.errors.len(), "Run completed with errors")
            }
            RunStatus::Completed => info!(run_id = %run_id, cost = run.total_cost, "Run completed"),
            RunStatus::Failed => error!(run_id = %run_id, errors = run.errors.len(), "Run failed"),
            other => info!(run_id = %run_id, status = %other, "Run finished"),
        }
        Ok(run)
    }

    /// Run a catalog definition as a child of `parent`. The child stops
    /// when `cancel` fires and bounds its stage timeouts by `deadline`.
    pub fn run_child<'a>(
        &'a self,
        definition_id: &'a str,
        variables: Map<String, Value>,
        parent: &'a ExecutionContext,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<RunExecution>> {
        Box::pin(async move {
            let max_depth = self.engine.config().engine.max_nesting_depth;
            if parent.depth() + 1 > max_depth {
                return Err(ConductorError::NestingTooDeep(max_depth));
            }
            let definition = self.engine.definition(definition_id).map_err(|_| {
                ConductorError::UnsupportedExecutor {
                    kind: "orchestrator".into(),
                    executor: definition_id.to_string(),
                }
            })?;
            let run = self
                .engine
                .tracker()
                .begin(
                    &definition,
                    &format!("run:{}", parent.run_id()),
                    variables.clone(),
                    Some(parent.run_id().clone()),
                )
                .await?;
            debug!(parent = %parent.run_id(), child = %run.id, definition = definition_id, "Starting nested run");
            let ctx = parent.child(run.id, variables, cancel, deadline);
            self.execute_run(&definition, &ctx).await
        })
    }

    async fn run_phase(&self, phase: &[&StepSpec], ctx: &ExecutionContext) -> PhaseOutcome {
        let halt = AtomicBool::new(false);

        let outcomes = if let [stage] = phase {
            vec![self.run_stage(stage, ctx, &halt).await]
        } else {
            let permits = Semaphore::new(self.engine.config().engine.max_parallel_stages.max(1));
            let futs = phase.iter().map(|stage| {
                let (permits, halt) = (&permits, &halt);
                async move {
                    let Ok(_permit) = permits.acquire().await else {
                        return StageOutcome::NotStarted;
                    };
                    self.run_stage(stage, ctx, halt).await
                }
            });
            futures::future::join_all(futs).await
        };

        if outcomes.contains(&StageOutcome::Halted) {
            PhaseOutcome::Halt
        } else if outcomes.contains(&StageOutcome::Cancelled) || ctx.is_cancelled() {
            PhaseOutcome::Cancelled
        } else {
            PhaseOutcome::Continue
        }
    }

    async fn run_stage(
        &self,
        stage: &StepSpec,
        ctx: &ExecutionContext,
        halt: &AtomicBool,
    ) -> StageOutcome {
        if halt.load(Ordering::SeqCst) || ctx.is_cancelled() {
            return StageOutcome::NotStarted;
        }
        let outcome = match self.drive_stage(stage, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Tracker rejected a transition; nothing sensible left to record.
                error!(run_id = %ctx.run_id(), stage = %stage.id, error = %e, "Stage bookkeeping failed");
                StageOutcome::Halted
            }
        };
        if outcome == StageOutcome::Halted {
            halt.store(true, Ordering::SeqCst);
        }
        outcome
    }

    async fn drive_stage(&self, stage: &StepSpec, ctx: &ExecutionContext) -> Result<StageOutcome> {
        let tracker = self.engine.tracker();
        let run_id = ctx.run_id();

        if let Some(condition) = &stage.condition {
            match evaluate_condition(condition, &ctx.scope()) {
                Ok(true) => {}
                Ok(false) => {
                    tracker
                        .record_stage_skipped(run_id, &stage.id, &format!("condition '{condition}' is false"))
                        .await?;
                    info!(run_id = %run_id, stage = %stage.id, "Stage skipped");
                    return Ok(StageOutcome::Skipped);
                }
                Err(e) => return self.fail_before_start(stage, ctx, e).await,
            }
        }

        let input = match resolve_input(stage, ctx) {
            Ok(input) => input,
            Err(e) => return self.fail_before_start(stage, ctx, e).await,
        };

        let full_timeout = stage_timeout(self.engine.config(), stage);

        loop {
            let Some(timeout) = ctx.clamp_timeout(full_timeout) else {
                debug!(run_id = %run_id, stage = %stage.id, "Run deadline passed before attempt");
                return self.cancel_stage(stage, ctx, Vec::new(), 0).await;
            };
            let timeout_ms = timeout.as_millis() as u64;
            let attempt = tracker
                .record_stage_start(run_id, &stage.id, &input, Some(timeout_ms))
                .await?;
            debug!(run_id = %run_id, stage = %stage.id, attempt, "Invoking stage");
            let started = Instant::now();

            let invocation = self.invoker.invoke(stage, input.clone(), ctx, attempt);
            let outcome = if stage.kind == ExecutorKind::Orchestrator {
                // Nested runs stop themselves at the deadline and finish their record.
                Ok(invocation.await)
            } else {
                tokio::time::timeout(timeout, invocation).await
            };
            let mut result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let label = if stage.executor.is_empty() {
                        stage.kind.to_string()
                    } else {
                        stage.executor.clone()
                    };
                    let err = ConductorError::Timeout {
                        executor: label,
                        timeout_ms,
                        elapsed_ms,
                    };
                    StepResult::failed(
                        err.to_detail()
                            .with_run(run_id.to_string())
                            .with_stage(stage.id.clone()),
                    )
                    .with_log(ctx.take_logs(&stage.id))
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if result.success {
                match apply_output(stage, &result.output, ctx) {
                    Ok(()) => {
                        ctx.record_output(&stage.id, result.output.clone());
                        tracker
                            .record_stage_end(run_id, &stage.id, result, elapsed_ms)
                            .await?;
                        info!(run_id = %run_id, stage = %stage.id, attempt, elapsed_ms, "Stage completed");
                        return Ok(StageOutcome::Completed);
                    }
                    Err(e) => {
                        let detail = e
                            .to_detail()
                            .with_run(run_id.to_string())
                            .with_stage(stage.id.clone());
                        result = StepResult::failed(detail).with_log(result.log);
                    }
                }
            }

            let detail = result.error.clone().unwrap_or_else(|| {
                ErrorDetail::new(ErrorKind::Internal, "stage failed without detail")
            });
            if detail.kind == ErrorKind::Cancelled || ctx.is_cancelled() {
                return self.cancel_stage(stage, ctx, result.log, elapsed_ms).await;
            }

            if detail.root_cause().kind.is_retryable() {
                match tracker
                    .record_attempt_failed(
                        run_id,
                        &stage.id,
                        detail.clone(),
                        result.log.clone(),
                        elapsed_ms,
                        stage.max_retries,
                    )
                    .await
                {
                    Ok(retry_count) => {
                        warn!(
                            run_id = %run_id,
                            stage = %stage.id,
                            retry_count,
                            max_retries = stage.max_retries,
                            error = %detail,
                            "Retrying stage"
                        );
                        if !self.backoff(retry_count, ctx).await {
                            return self.cancel_stage(stage, ctx, Vec::new(), 0).await;
                        }
                        continue;
                    }
                    Err(ConductorError::RetryLimitExceeded { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            let halts = detail.kind.is_fatal() || !stage.continue_on_error;
            tracker.record_stage_end(run_id, &stage.id, result, elapsed_ms).await?;
            if halts {
                error!(run_id = %run_id, stage = %stage.id, error = %detail, "Stage failed, halting run");
                return Ok(StageOutcome::Halted);
            }
            warn!(run_id = %run_id, stage = %stage.id, error = %detail, "Stage failed, continuing");
            return Ok(StageOutcome::Tolerated);
        }
    }

    /// End a stage as Cancelled. Attempts that already failed keep their error.
    async fn cancel_stage(
        &self,
        stage: &StepSpec,
        ctx: &ExecutionContext,
        log: Vec<String>,
        elapsed_ms: u64,
    ) -> Result<StageOutcome> {
        let detail = ConductorError::Cancelled.to_detail().with_stage(stage.id.clone());
        let result = StepResult::failed(detail).with_log(log);
        self.engine
            .tracker()
            .record_stage_end(ctx.run_id(), &stage.id, result, elapsed_ms)
            .await?;
        info!(run_id = %ctx.run_id(), stage = %stage.id, "Stage cancelled");
        Ok(StageOutcome::Cancelled)
    }

    /// Record a failure that happened before the stage could be invoked.
    async fn fail_before_start(
        &self,
        stage: &StepSpec,
        ctx: &ExecutionContext,
        err: ConductorError,
    ) -> Result<StageOutcome> {
        let detail = err
            .to_detail()
            .with_run(ctx.run_id().to_string())
            .with_stage(stage.id.clone());
        let halts = detail.kind.is_fatal() || !stage.continue_on_error;
        error!(run_id = %ctx.run_id(), stage = %stage.id, error = %detail, "Stage could not start");
        self.engine
            .tracker()
            .record_stage_end(ctx.run_id(), &stage.id, StepResult::failed(detail), 0)
            .await?;
        Ok(if halts {
            StageOutcome::Halted
        } else {
            StageOutcome::Tolerated
        })
    }

    /// Wait before a retry when backoff is configured. Returns false if the
    /// run was cancelled meanwhile.
    async fn backoff(&self, retry_count: u32, ctx: &ExecutionContext) -> bool {
        let retry = &self.engine.config().engine.retry;
        if retry.backoff == BackoffPolicy::Exponential {
            let delay = calculate_backoff(
                retry_count.saturating_sub(1),
                retry.initial_backoff_ms,
                retry.max_backoff_ms,
            );
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        !ctx.is_cancelled()
    }
}

/// Timeout of one stage attempt: the stage's own setting or the engine default.
pub(crate) fn stage_timeout(config: &EngineConfig, stage: &StepSpec) -> Duration {
    Duration::from_secs(
        stage
            .timeout_secs
            .unwrap_or(config.engine.default_stage_timeout_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::config::EngineConfig;
    use conductor_core::definition::{ExecutorKind, InputSource};
    use conductor_core::types::StepStatus;
    use conductor_executors::ExecutorRegistry;
    use conductor_test_utils::{
        FailureMode, LoopingReasoner, RecordingExecutor, ScriptedExecutor, ScriptedReasoner,
        SlowExecutor,
    };
    use serde_json::json;

    fn engine(registry: ExecutorRegistry) -> Arc<Engine> {
        Engine::builder(EngineConfig::default())
            .registry(registry)
            .reasoner(Arc::new(ScriptedReasoner::immediate("finished")))
            .build()
    }

    async fn run(engine: &Arc<Engine>, def: &WorkflowDefinition) -> RunExecution {
        StageController::new(engine.clone())
            .execute(def, Map::new(), CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let mut registry = ExecutorRegistry::new();
        registry.register(RecordingExecutor::new("a"));
        let flaky = ScriptedExecutor::new("b").failing(2);
        let calls = flaky.counter();
        registry.register(flaky);
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("a", 1, "a"))
            .with_stage(StepSpec::tool("b", 2, "b"))
            .with_stage(StepSpec::agent_stage("c", 3, "Summarize"));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Completed);
        let b = run.step("b").unwrap();
        assert_eq!(b.status, StepStatus::Completed);
        assert_eq!(b.retry_count, 2);
        assert_eq!(b.attempts.len(), 3);
        assert_eq!(calls.get(), 3);
        assert_eq!(run.step("c").unwrap().status, StepStatus::Completed);
        assert_eq!(run.results["c"]["answer"], json!("finished"));
        assert!(!run.has_errors());
    }

    #[tokio::test]
    async fn test_retries_exhausted_halts_run() {
        let mut registry = ExecutorRegistry::new();
        let broken = ScriptedExecutor::new("b").always_failing();
        let calls = broken.counter();
        registry.register(broken);
        let after = RecordingExecutor::new("after");
        let after_calls = after.calls();
        registry.register(after);
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("b", 1, "b").with_max_retries(2))
            .with_stage(StepSpec::tool("after", 2, "after"));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.get(), 3);
        assert_eq!(run.step("b").unwrap().retry_count, 2);
        assert_eq!(run.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("after").unwrap().status, StepStatus::Pending);
        assert!(after_calls.lock().unwrap().is_empty());
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].stage_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_continue_on_error_completes_with_errors() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("b").always_failing());
        registry.register(RecordingExecutor::new("after"));
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("b", 1, "b").with_max_retries(0).continue_on_error())
            .with_stage(StepSpec::tool("after", 2, "after"));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.has_errors());
        assert_eq!(run.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("after").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_configuration_error_not_retried_and_fatal() {
        let mut registry = ExecutorRegistry::new();
        let bad = ScriptedExecutor::new("bad").always_failing().with_mode(FailureMode::Config);
        let calls = bad.counter();
        registry.register(bad);
        registry.register(RecordingExecutor::new("after"));
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("bad", 1, "bad").continue_on_error())
            .with_stage(StepSpec::tool("after", 2, "after"));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.get(), 1);
        assert_eq!(run.step("bad").unwrap().retry_count, 0);
        assert_eq!(run.errors[0].kind, ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_false_condition_skips_without_invoking() {
        let mut registry = ExecutorRegistry::new();
        let gated = RecordingExecutor::new("gated");
        let calls = gated.calls();
        registry.register(gated);
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("gated", 1, "gated").with_condition("enabled == true"));
        let mut vars = Map::new();
        vars.insert("enabled".into(), json!(false));
        let run = StageController::new(engine.clone())
            .execute(&def, vars, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step("gated").unwrap().status, StepStatus::Skipped);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outputs_flow_to_later_stages() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("fetch").with_output(json!({"user": {"id": 42}})));
        let sink = RecordingExecutor::new("store");
        let calls = sink.calls();
        registry.register(sink);
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("fetch", 1, "fetch").with_output("user_id", "user.id"))
            .with_stage(
                StepSpec::tool("store", 2, "store")
                    .with_input("id", InputSource::variable("user_id"))
                    .with_input("raw", InputSource::step("fetch", "user")),
            );
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.variables["user_id"], json!(42));
        assert_eq!(calls.lock().unwrap()[0], json!({"id": 42, "raw": {"id": 42}}));
    }

    #[tokio::test]
    async fn test_missing_output_path_fails_stage() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("fetch").with_output(json!({"other": 1})));
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("fetch", 1, "fetch").with_output("user_id", "user.id"));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step("fetch").unwrap().status, StepStatus::Failed);
        assert!(run.variables.get("user_id").is_none());
    }

    #[tokio::test]
    async fn test_parallel_phase_runs_every_stage() {
        let mut registry = ExecutorRegistry::new();
        for id in ["p1", "p2", "p3"] {
            registry.register(ScriptedExecutor::new(id).with_output(json!({ "from": id })));
        }
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("p1", 1, "p1").in_group("fan").with_output("one", "from"))
            .with_stage(StepSpec::tool("p2", 2, "p2").in_group("fan").with_output("two", "from"))
            .with_stage(StepSpec::tool("p3", 3, "p3").in_group("fan").with_output("three", "from"));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.variables["one"], json!("p1"));
        assert_eq!(run.variables["two"], json!("p2"));
        assert_eq!(run.variables["three"], json!("p3"));
        assert_eq!(run.results.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_retried_then_fails() {
        let mut registry = ExecutorRegistry::new();
        let slow = SlowExecutor::new("slow", 3_000);
        let calls = slow.counter();
        registry.register(slow);
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("slow", 1, "slow").with_timeout(1).with_max_retries(1));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.get(), 2);
        let step = run.step("slow").unwrap();
        assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(step.attempts[0].timeout_ms, Some(1_000));
        assert!(step.attempts[0].elapsed_ms >= 1_000);
    }

    #[tokio::test]
    async fn test_budget_exhausted_is_not_retried() {
        let engine = Engine::builder(EngineConfig::default())
            .registry(ExecutorRegistry::new())
            .reasoner(Arc::new(LoopingReasoner::new()))
            .build();
        let mut stage = StepSpec::agent_stage("think", 1, "Never ends");
        if let Some(agent) = stage.agent.as_mut() {
            agent.max_cycles = Some(2);
        }
        let def = WorkflowDefinition::new("wf", "Workflow").with_stage(stage);
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        let step = run.step("think").unwrap();
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::BudgetExhausted);
        assert!(step.log.iter().any(|l| l.contains("no final answer")));
    }

    #[tokio::test]
    async fn test_nested_run_and_depth_guard() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("leaf").with_output(json!({"v": 1})));
        let engine = engine(registry);
        engine
            .register_definition(
                WorkflowDefinition::new("child", "Child").with_stage(StepSpec::tool("leaf", 1, "leaf")),
            )
            .unwrap();

        let def = WorkflowDefinition::new("parent", "Parent").with_stage(
            StepSpec::new("sub", ExecutorKind::Orchestrator, 1).with_executor("child"),
        );
        let run = run(&engine, &def).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.results["sub"]["results"]["leaf"], json!({"v": 1}));

        // A definition that nests itself stops at the configured depth.
        engine
            .register_definition(WorkflowDefinition::new("loop", "Loop").with_stage(
                StepSpec::new("again", ExecutorKind::Orchestrator, 1).with_executor("loop"),
            ))
            .unwrap();
        let looping = engine.definition("loop").unwrap();
        let run = StageController::new(engine.clone())
            .execute(&looping, Map::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let root = run.errors[0].root_cause();
        assert_eq!(root.kind, ErrorKind::Configuration);
        assert!(root.message.contains("maximum depth"));
    }

    #[tokio::test]
    async fn test_nested_failure_keeps_child_cause() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("bad").always_failing().with_mode(FailureMode::Config));
        let engine = engine(registry);
        engine
            .register_definition(
                WorkflowDefinition::new("child", "Child").with_stage(StepSpec::tool("bad", 1, "bad")),
            )
            .unwrap();

        let def = WorkflowDefinition::new("parent", "Parent").with_stage(
            StepSpec::new("sub", ExecutorKind::Orchestrator, 1).with_executor("child"),
        );
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        let detail = &run.errors[0];
        assert_eq!(detail.kind, ErrorKind::NestedRun);
        let cause = detail.cause.as_deref().unwrap();
        assert_eq!(cause.kind, ErrorKind::Configuration);
        assert_eq!(cause.stage_id.as_deref(), Some("bad"));
        // Configuration root cause: the parent stage is not retried.
        assert_eq!(run.step("sub").unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut registry = ExecutorRegistry::new();
        let exec = RecordingExecutor::new("a");
        let calls = exec.calls();
        registry.register(exec);
        let engine = engine(registry);
        let def = WorkflowDefinition::new("wf", "Workflow").with_stage(StepSpec::tool("a", 1, "a"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = StageController::new(engine.clone())
            .execute(&def, Map::new(), cancel)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.step("a").unwrap().status, StepStatus::Cancelled);
        assert!(!run.has_errors());
        assert!(calls.lock().unwrap().is_empty());
    }
    #[tokio::test]
    async fn test_final_attempt_log_kept_when_retries_exhausted() {
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("once").always_failing().with_mode(FailureMode::Output));
        registry.register(ScriptedExecutor::new("twice").always_failing());
        let engine = engine(registry);

        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("once", 1, "once").with_max_retries(0).continue_on_error())
            .with_stage(StepSpec::tool("twice", 2, "twice").with_max_retries(1));
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        let once = run.step("once").unwrap();
        assert_eq!(once.status, StepStatus::Failed);
        assert_eq!(once.log, vec!["tool 'once' attempt 1: failed".to_string()]);

        let twice = run.step("twice").unwrap();
        assert_eq!(twice.retry_count, 1);
        assert!(twice.log.iter().any(|l| l.starts_with("tool 'twice' attempt 1: error")));
        assert!(twice.log.iter().any(|l| l.starts_with("tool 'twice' attempt 2: error")));
        assert!(twice.attempts.iter().all(|a| a.error.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_run_stopped_at_stage_deadline() {
        let mut registry = ExecutorRegistry::new();
        let slow = SlowExecutor::new("slow", 3_000);
        let calls = slow.counter();
        registry.register(slow);
        let engine = engine(registry);
        engine
            .register_definition(
                WorkflowDefinition::new("child", "Child").with_stage(StepSpec::tool("slow", 1, "slow")),
            )
            .unwrap();

        let def = WorkflowDefinition::new("parent", "Parent").with_stage(
            StepSpec::new("sub", ExecutorKind::Orchestrator, 1)
                .with_executor("child")
                .with_timeout(1)
                .with_max_retries(0),
        );
        let run = run(&engine, &def).await;

        assert_eq!(run.status, RunStatus::Failed);
        let sub = run.step("sub").unwrap();
        assert_eq!(sub.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(calls.get(), 1);

        // The child run is finished, not left running.
        assert!(engine.tracker().active_runs().await.is_empty());
        let children = engine.tracker().history("child", 0, 10).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, RunStatus::Cancelled);
        let child = engine.tracker().snapshot(&children[0].run_id).await.unwrap().unwrap();
        assert_eq!(child.parent_run_id.as_ref(), Some(&run.id));
        assert_eq!(child.step("slow").unwrap().status, StepStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_keeps_attempt_error() {
        let mut config = EngineConfig::default();
        config.engine.retry.backoff = BackoffPolicy::Exponential;
        config.engine.retry.initial_backoff_ms = 200;
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("flaky").always_failing());
        let engine = Engine::builder(config).registry(registry).build();
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("flaky", 1, "flaky").with_max_retries(3));

        let cancel = CancellationToken::new();
        let task = {
            let (engine, cancel) = (engine.clone(), cancel.clone());
            tokio::spawn(async move {
                StageController::new(engine)
                    .execute(&def, Map::new(), cancel)
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let run = task.await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        let step = run.step("flaky").unwrap();
        assert_eq!(step.status, StepStatus::Cancelled);
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.attempts.len(), 1);
        let error = step.attempts[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Transient);
        assert!(error.message.contains("scripted failure 1"));
        assert!(!run.has_errors());
    }
}
