use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::definition::ExecutorKind;
use crate::error::Result;
use crate::types::*;

/// Executor: a tool, adapter, or any other unit a stage delegates to.
pub trait Executor: Send + Sync + 'static {
    /// Identifier used by stage definitions and agent actions.
    fn id(&self) -> &str;

    /// Registry slot this executor fills.
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Tool
    }

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the parameter object.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute with the resolved parameter object.
    fn execute(
        &self,
        params: serde_json::Value,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<ExecutorOutput>>;

    /// Preferred timeout; stage and engine settings apply when `None`.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Reasoning backend: produces the next thought for an agent.
pub trait ReasoningBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Produce the next thought given the objective and scratchpad so far.
    fn think(&self, request: ThinkRequest) -> BoxFuture<'_, Result<Thought>>;
}

/// LLM client: single-shot chat completion.
pub trait LlmClient: Send + Sync + 'static {
    fn complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Persistence sink: durable run and step snapshots.
pub trait PersistenceSink: Send + Sync + 'static {
    /// Write the full run snapshot.
    fn save_run(&self, run: &RunExecution) -> BoxFuture<'_, Result<()>>;

    /// Write one stage record of a run.
    fn save_step(&self, run_id: &RunId, step: &StepExecution) -> BoxFuture<'_, Result<()>>;

    /// Read a run snapshot back.
    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunExecution>>>;

    /// Run summaries for a definition, newest first.
    fn list_runs(
        &self,
        definition_id: &str,
        offset: usize,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}
