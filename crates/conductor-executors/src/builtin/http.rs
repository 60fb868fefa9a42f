use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Executor;
use conductor_core::types::{ExecutorOutput, InvocationContext};

const MAX_BODY: usize = 10_000;

/// Makes an HTTP request; JSON bodies are parsed, others returned as text.
pub struct HttpRequestTool;

#[derive(Deserialize)]
struct HttpRequestInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".into()
}

impl Executor for HttpRequestTool {
    fn id(&self) -> &str {
        "http_request"
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(60)
    }

    fn description(&self) -> &str {
        "Make an HTTP request. Returns status, headers, and body."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "description": "HTTP method (default: GET)" },
                "headers": { "type": "object", "description": "Request headers" },
                "body": { "description": "Request body; objects are sent as JSON" }
            },
            "required": ["url"]
        })
    }

    fn execute(
        &self,
        params: serde_json::Value,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move {
            let invalid = |reason: String| ConductorError::InvalidParameters {
                stage: ctx.stage_id.clone(),
                reason,
            };
            let p: HttpRequestInput =
                serde_json::from_value(params).map_err(|e| invalid(e.to_string()))?;
            let failed = |e: reqwest::Error| ConductorError::ExecutorFailed {
                executor: "http_request".into(),
                message: e.to_string(),
            };

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(failed)?;

            let method = p
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| invalid(format!("Invalid method: {e}")))?;

            let mut req = client.request(method, &p.url);
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            req = match p.body {
                Some(serde_json::Value::String(text)) => req.body(text),
                Some(serde_json::Value::Null) | None => req,
                Some(json) => req.json(&json),
            };

            let resp = req.send().await.map_err(failed)?;
            let status = resp.status();
            let headers: serde_json::Map<String, serde_json::Value> = resp
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("?").into()))
                .collect();
            let text = resp.text().await.map_err(failed)?;
            let body = match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(json) => json,
                Err(_) => {
                    let mut cut = text.len().min(MAX_BODY);
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    serde_json::Value::String(text[..cut].to_string())
                }
            };

            let result = serde_json::json!({
                "status": status.as_u16(),
                "headers": headers,
                "body": body,
            });

            if status.is_success() {
                Ok(ExecutorOutput::success(result))
            } else {
                let mut failure = ExecutorOutput::failure(format!("HTTP {status}"));
                failure.output = result;
                Ok(failure)
            }
        })
    }
}
