//! Scripted executors, reasoning backends, and fixtures shared by tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use conductor_core::definition::ExecutorKind;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::{Executor, ReasoningBackend};
use conductor_core::types::{ExecutorOutput, InvocationContext, RunId, ThinkRequest, Thought};

/// Shared call counter handed out by the scripted mocks.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// How a scripted failure surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// `Err(ExecutorFailed)`, retryable.
    Error,
    /// `Ok(ExecutorOutput { success: false, .. })`.
    Output,
    /// `Err(InvalidParameters)`, a configuration error.
    Config,
}

/// Fails the first `failures` calls, then succeeds with `output`.
pub struct ScriptedExecutor {
    id: String,
    kind: ExecutorKind,
    failures: u32,
    mode: FailureMode,
    output: Value,
    calls: CallCounter,
}

impl ScriptedExecutor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ExecutorKind::Tool,
            failures: 0,
            mode: FailureMode::Error,
            output: json!({ "ok": true }),
            calls: CallCounter::default(),
        }
    }

    pub fn failing(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    /// Never succeeds.
    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    pub fn with_mode(mut self, mode: FailureMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_kind(mut self, kind: ExecutorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl Executor for ScriptedExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    fn description(&self) -> &str {
        "Scripted test executor"
    }

    fn execute(&self, _params: Value, ctx: InvocationContext) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move {
            let call = self.calls.bump();
            if call <= self.failures {
                let message = format!("scripted failure {call}");
                return match self.mode {
                    FailureMode::Error => Err(ConductorError::ExecutorFailed {
                        executor: self.id.clone(),
                        message,
                    }),
                    FailureMode::Output => Ok(ExecutorOutput::failure(message)),
                    FailureMode::Config => Err(ConductorError::InvalidParameters {
                        stage: ctx.stage_id,
                        reason: message,
                    }),
                };
            }
            Ok(ExecutorOutput::success(self.output.clone()))
        })
    }
}

/// Records every parameter object it receives and echoes it back.
pub struct RecordingExecutor {
    id: String,
    kind: ExecutorKind,
    calls: Arc<Mutex<Vec<Value>>>,
    cost: f64,
}

impl RecordingExecutor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ExecutorKind::Tool,
            calls: Arc::new(Mutex::new(Vec::new())),
            cost: 0.0,
        }
    }

    pub fn with_kind(mut self, kind: ExecutorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Handle to the recorded calls.
    pub fn calls(&self) -> Arc<Mutex<Vec<Value>>> {
        self.calls.clone()
    }
}

impl Executor for RecordingExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    fn description(&self) -> &str {
        "Recording test executor"
    }

    fn execute(&self, params: Value, _ctx: InvocationContext) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(params.clone());
            Ok(ExecutorOutput::success(params).with_cost(self.cost))
        })
    }
}

/// Sleeps before succeeding.
pub struct SlowExecutor {
    id: String,
    delay: Duration,
    timeout_secs: Option<u64>,
    calls: CallCounter,
}

impl SlowExecutor {
    pub fn new(id: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            id: id.into(),
            delay: Duration::from_millis(delay_ms),
            timeout_secs: None,
            calls: CallCounter::default(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl Executor for SlowExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Slow test executor"
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }

    fn execute(&self, params: Value, _ctx: InvocationContext) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move {
            self.calls.bump();
            tokio::time::sleep(self.delay).await;
            Ok(ExecutorOutput::success(params))
        })
    }
}

/// Plays back a fixed list of thoughts; repeats the last one when exhausted.
pub struct ScriptedReasoner {
    thoughts: Mutex<VecDeque<Thought>>,
    last: Mutex<Option<Thought>>,
    requests: Arc<Mutex<Vec<ThinkRequest>>>,
}

impl ScriptedReasoner {
    pub fn new(thoughts: Vec<Thought>) -> Self {
        Self {
            thoughts: Mutex::new(thoughts.into()),
            last: Mutex::new(None),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers on the first cycle.
    pub fn immediate(answer: impl Into<String>) -> Self {
        Self::new(vec![Thought::answer("I know the answer.", answer)])
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<ThinkRequest>>> {
        self.requests.clone()
    }
}

impl ReasoningBackend for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    fn think(&self, request: ThinkRequest) -> BoxFuture<'_, Result<Thought>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let next = self.thoughts.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            match next {
                Some(thought) => {
                    *last = Some(thought.clone());
                    Ok(thought)
                }
                None => last
                    .clone()
                    .ok_or_else(|| ConductorError::AgentExecution("script is empty".into())),
            }
        })
    }
}

/// Never concludes; optionally calls a tool every cycle.
pub struct LoopingReasoner {
    tool: Option<String>,
    calls: CallCounter,
}

impl LoopingReasoner {
    pub fn new() -> Self {
        Self {
            tool: None,
            calls: CallCounter::default(),
        }
    }

    pub fn calling(tool: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.into()),
            calls: CallCounter::default(),
        }
    }

    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl Default for LoopingReasoner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReasoningBackend for LoopingReasoner {
    fn name(&self) -> &str {
        "looping"
    }

    fn think(&self, request: ThinkRequest) -> BoxFuture<'_, Result<Thought>> {
        Box::pin(async move {
            self.calls.bump();
            let text = format!("Still thinking (cycle {})", request.cycle);
            Ok(match &self.tool {
                Some(tool) => Thought::act(text, tool.clone(), json!({ "cycle": request.cycle })),
                None => Thought::reasoning(text),
            })
        })
    }
}

/// Fails every reasoning call.
pub struct FailingReasoner;

impl ReasoningBackend for FailingReasoner {
    fn name(&self) -> &str {
        "failing"
    }

    fn think(&self, _request: ThinkRequest) -> BoxFuture<'_, Result<Thought>> {
        Box::pin(async { Err(ConductorError::LlmRequest("backend unavailable".into())) })
    }
}

/// Invocation context for direct executor calls in tests.
pub fn test_context(stage_id: &str) -> InvocationContext {
    InvocationContext {
        run_id: RunId::new(),
        stage_id: stage_id.to_string(),
        attempt: 1,
        working_dir: std::env::temp_dir(),
    }
}

/// Write a config file into a temp dir and return both.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("conductor.toml");
    std::fs::write(&path, contents).expect("write config");
    (dir, path)
}

/// Parse TOML straight into a config type.
pub fn parse_toml<T: serde::de::DeserializeOwned>(contents: &str) -> T {
    toml::from_str(contents).expect("valid toml")
}
