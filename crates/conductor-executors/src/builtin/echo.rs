use futures::future::BoxFuture;

use conductor_core::error::Result;
use conductor_core::traits::Executor;
use conductor_core::types::{ExecutorOutput, InvocationContext};

/// Returns its parameters unchanged.
pub struct EchoTool;

impl Executor for EchoTool {
    fn id(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the input parameters unchanged. Useful for shaping data between stages."
    }

    fn execute(
        &self,
        params: serde_json::Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move { Ok(ExecutorOutput::success(params)) })
    }
}
