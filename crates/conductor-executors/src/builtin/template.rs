use futures::future::BoxFuture;
use serde::Deserialize;

use conductor_core::definition::render_template;
use conductor_core::error::{ConductorError, Result};
use conductor_core::expr::lookup_path;
use conductor_core::traits::Executor;
use conductor_core::types::{ExecutorOutput, InvocationContext};

/// Renders a `{{path}}` template against a values object.
pub struct TemplateTool;

#[derive(Deserialize)]
struct TemplateInput {
    template: String,
    #[serde(default)]
    values: serde_json::Value,
}

impl Executor for TemplateTool {
    fn id(&self) -> &str {
        "template"
    }

    fn description(&self) -> &str {
        "Render a text template. `{{path}}` placeholders are replaced from `values`."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "template": { "type": "string" },
                "values": { "type": "object", "description": "Values addressed by dotted paths" }
            },
            "required": ["template"]
        })
    }

    fn execute(
        &self,
        params: serde_json::Value,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move {
            let p: TemplateInput =
                serde_json::from_value(params).map_err(|e| ConductorError::InvalidParameters {
                    stage: ctx.stage_id.clone(),
                    reason: e.to_string(),
                })?;
            let text = render_template(&p.template, |path| lookup_path(&p.values, path).cloned());
            Ok(ExecutorOutput::success(serde_json::json!({ "text": text })))
        })
    }
}
