use futures::future::BoxFuture;
use tracing::debug;

use conductor_core::config::ModelConfig;
use conductor_core::error::Result;
use conductor_core::traits::{LlmClient, ReasoningBackend};
use conductor_core::types::{ThinkRequest, Thought};

use crate::react_format::{build_messages, parse_thought};

/// Reasoning backend that prompts a chat model in the ReAct text format.
pub struct LlmReasoner {
    client: Box<dyn LlmClient>,
    model: ModelConfig,
    system_prompt: Option<String>,
}

impl LlmReasoner {
    pub fn new(client: Box<dyn LlmClient>, model: ModelConfig) -> Self {
        Self {
            client,
            model,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }
}

impl ReasoningBackend for LlmReasoner {
    fn name(&self) -> &str {
        &self.model.model_id
    }

    fn think(&self, request: ThinkRequest) -> BoxFuture<'_, Result<Thought>> {
        Box::pin(async move {
            let messages = build_messages(&request, self.system_prompt.as_deref());
            let reply = self.client.complete(&self.model, messages).await?;
            debug!(cycle = request.cycle, chars = reply.len(), "Model replied");
            parse_thought(&reply)
        })
    }
}
