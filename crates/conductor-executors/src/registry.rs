use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use conductor_core::definition::ExecutorKind;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Executor;
use conductor_core::types::{ExecutorOutput, InvocationContext, ToolDescriptor};

/// Registry of executors keyed by `(kind, id)`.
pub struct ExecutorRegistry {
    executors: HashMap<(ExecutorKind, String), Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its own kind and id.
    pub fn register(&mut self, executor: impl Executor) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn Executor>) {
        let key = (executor.kind(), executor.id().to_string());
        self.executors.insert(key, executor);
    }

    /// Unregister an executor.
    pub fn unregister(&mut self, kind: ExecutorKind, id: &str) -> bool {
        self.executors.remove(&(kind, id.to_string())).is_some()
    }

    pub fn get(&self, kind: ExecutorKind, id: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(&(kind, id.to_string())).cloned()
    }

    /// Look up an executor, failing with a configuration error if absent.
    pub fn resolve(&self, kind: ExecutorKind, id: &str) -> Result<Arc<dyn Executor>> {
        self.get(kind, id)
            .ok_or_else(|| ConductorError::UnsupportedExecutor {
                kind: kind.to_string(),
                executor: id.to_string(),
            })
    }

    /// Ids registered under a kind, sorted.
    pub fn list(&self, kind: ExecutorKind) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .executors
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Descriptors for the tools an agent may call. An empty allow-list
    /// means every registered tool.
    pub fn descriptors(&self, allow: &[String]) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .executors
            .iter()
            .filter(|((kind, id), _)| {
                *kind == ExecutorKind::Tool && (allow.is_empty() || allow.contains(id))
            })
            .map(|(_, e)| ToolDescriptor {
                name: e.id().to_string(),
                description: e.description().to_string(),
                input_schema: e.input_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute an executor, honoring its own timeout when it declares one.
    pub async fn execute(
        &self,
        kind: ExecutorKind,
        id: &str,
        params: serde_json::Value,
        ctx: InvocationContext,
    ) -> Result<ExecutorOutput> {
        let executor = self.resolve(kind, id)?;
        debug!(kind = %kind, executor = id, stage = %ctx.stage_id, "Executing");

        let Some(secs) = executor.timeout_secs() else {
            return executor.execute(params, ctx).await;
        };
        let timeout = std::time::Duration::from_secs(secs);
        let started = Instant::now();

        match tokio::time::timeout(timeout, executor.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ConductorError::Timeout {
                executor: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Create a registry with all built-in executors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::echo::EchoTool);
        registry.register(crate::builtin::template::TemplateTool);
        registry.register(crate::builtin::http::HttpRequestTool);
        registry.register(crate::builtin::shell::ShellTool);
        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
