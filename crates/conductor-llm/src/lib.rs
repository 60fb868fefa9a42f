pub mod openai;
pub mod react_format;
pub mod reasoner;
pub mod retry;

use conductor_core::config::ModelConfig;
use conductor_core::traits::LlmClient;

pub use openai::OpenAiClient;
pub use reasoner::LlmReasoner;
pub use retry::RetryingClient;

/// Create an LLM client for the configured provider, wrapped with retries
/// when the model config asks for them.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    // Every supported provider speaks the OpenAI chat-completions protocol.
    let client: Box<dyn LlmClient> = Box::new(OpenAiClient::new());
    match &config.retry {
        Some(retry) => Box::new(RetryingClient::new(client, retry.clone())),
        None => client,
    }
}
