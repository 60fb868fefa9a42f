use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use conductor_core::config::AgentConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::ReasoningBackend;
use conductor_core::types::{ChosenAction, RunEvent, ThinkRequest};

use crate::context::ExecutionContext;
use crate::invoker::StepInvoker;
use crate::scratchpad::Scratchpad;

/// Bounded think / act / observe loop toward one objective.
///
/// Each cycle asks the reasoning backend for a thought. A final answer ends
/// the loop; a chosen action is run through the step invoker and its result
/// recorded as an observation. Cancellation is honored between cycles only.
pub struct ReActAgent<'a> {
    backend: &'a dyn ReasoningBackend,
    invoker: &'a StepInvoker,
    config: &'a AgentConfig,
    tools: Vec<String>,
    max_cycles: u32,
}

impl<'a> ReActAgent<'a> {
    pub fn new(
        backend: &'a dyn ReasoningBackend,
        invoker: &'a StepInvoker,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            backend,
            invoker,
            config,
            tools: Vec::new(),
            max_cycles: config.max_cycles,
        }
    }

    /// Restrict the tools the agent may call (empty = all tools).
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_cycles(mut self, max_cycles: u32) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    /// Run until a final answer, the cycle budget, a backend failure, or
    /// cancellation. The scratchpad keeps whatever was recorded either way.
    pub async fn run(
        &self,
        objective: &str,
        pad: &mut Scratchpad,
        ctx: &ExecutionContext,
        stage_id: &str,
    ) -> Result<String> {
        let engine = self.invoker.engine();
        let tools = engine.registry().descriptors(&self.tools);
        let think_timeout = Duration::from_secs(self.config.think_timeout_secs);
        let run_id = ctx.run_id();

        loop {
            if ctx.is_cancelled() {
                info!(run_id = %run_id, stage = stage_id, cycles = pad.cycles(), "Agent cancelled");
                return Err(ConductorError::Cancelled);
            }
            if pad.cycles() >= self.max_cycles {
                warn!(run_id = %run_id, stage = stage_id, max_cycles = self.max_cycles, "Agent exhausted its cycle budget");
                return Err(ConductorError::BudgetExhausted(self.max_cycles));
            }

            let cycle = pad.begin_cycle();
            let request = ThinkRequest {
                objective: objective.to_string(),
                scratchpad: pad.render(),
                tools: tools.clone(),
                cycle,
            };

            let thought = match tokio::time::timeout(think_timeout, self.backend.think(request)).await
            {
                Ok(Ok(thought)) => thought,
                Ok(Err(ConductorError::Cancelled)) => return Err(ConductorError::Cancelled),
                Ok(Err(e)) => {
                    return Err(ConductorError::AgentExecution(format!(
                        "reasoning backend '{}' failed: {e}",
                        self.backend.name()
                    )))
                }
                Err(_) => {
                    return Err(ConductorError::AgentExecution(format!(
                        "reasoning step timed out after {}s",
                        self.config.think_timeout_secs
                    )))
                }
            };

            pad.record_thought(thought.text.clone());
            engine.event_bus().publish(RunEvent::AgentThought {
                run_id: run_id.clone(),
                stage_id: stage_id.to_string(),
                cycle,
                text: thought.text,
            });

            if let Some(answer) = thought.final_answer {
                pad.conclude(answer.clone());
                info!(run_id = %run_id, stage = stage_id, cycles = cycle, "Agent reached a final answer");
                return Ok(answer);
            }

            let Some(action) = thought.action else {
                debug!(run_id = %run_id, stage = stage_id, cycle, "Reasoning step without action");
                continue;
            };

            pad.record_action(action.tool.clone(), action.input.clone());
            let (success, content, cost) = self.act(&action, ctx, stage_id, cycle).await;
            pad.add_cost(cost);
            pad.record_observation(success, content);
            engine.event_bus().publish(RunEvent::AgentAction {
                run_id: run_id.clone(),
                stage_id: stage_id.to_string(),
                cycle,
                tool: action.tool,
                success,
            });
        }
    }

    /// Execute a chosen action. Failures become error observations.
    async fn act(
        &self,
        action: &ChosenAction,
        ctx: &ExecutionContext,
        stage_id: &str,
        cycle: u32,
    ) -> (bool, String, f64) {
        let error_max = self.config.error_max_chars;
        if !self.tools.is_empty() && !self.tools.contains(&action.tool) {
            let message = format!("Tool '{}' is not available to this agent", action.tool);
            return (false, truncate(&message, error_max), 0.0);
        }

        debug!(stage = stage_id, tool = %action.tool, cycle, "Agent action");
        match self
            .invoker
            .invoke_tool(&action.tool, action.input.clone(), ctx, stage_id, cycle)
            .await
        {
            Ok(out) if out.success => (
                true,
                truncate(&render_value(&out.output), self.config.observation_max_chars),
                out.cost,
            ),
            Ok(out) => (
                false,
                truncate(
                    out.error_message.as_deref().unwrap_or("tool reported failure"),
                    error_max,
                ),
                out.cost,
            ),
            Err(e) => (false, truncate(&e.to_string(), error_max), 0.0),
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... [truncated]")
}
