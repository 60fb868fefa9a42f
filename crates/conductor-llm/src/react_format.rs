//! Text protocol spoken with the model:
//!
//! ```text
//! Thought: what to do next
//! Action: tool_name
//! Action Input: {"param": "value"}
//! ```
//!
//! or, once the objective is met, `Final Answer: ...`.

use std::sync::OnceLock;

use regex::Regex;

use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{ChatMessage, ChosenAction, ThinkRequest, Thought, ToolDescriptor};

pub const SYSTEM_PROMPT: &str = "You are an autonomous agent that completes an objective by \
reasoning step by step and calling tools.

Reply in exactly this format:
Thought: your reasoning about what to do next
Action: the tool name
Action Input: a JSON object with the tool parameters

You will then receive an Observation with the tool result. Repeat until you \
have enough information, then reply with:
Thought: I have everything I need
Final Answer: the answer to the objective

Never write an Observation yourself.";

struct Patterns {
    final_answer: Regex,
    action: Regex,
    action_input: Regex,
    marker: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        final_answer: Regex::new(r"(?is)Final Answer:\s*(.+)").expect("static regex"),
        action: Regex::new(r"(?im)^\s*Action:\s*(.+?)\s*$").expect("static regex"),
        action_input: Regex::new(r"(?is)Action Input:\s*(.+?)(?:\n\s*Observation:|\z)")
            .expect("static regex"),
        marker: Regex::new(r"(?im)^\s*(Action|Final Answer):").expect("static regex"),
    })
}

/// Render the tool list for the prompt.
pub fn render_tools(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "(no tools available)".to_string();
    }
    tools
        .iter()
        .map(|t| format!("- {}: {}\n  input schema: {}", t.name, t.description, t.input_schema))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the chat messages for one reasoning step.
pub fn build_messages(request: &ThinkRequest, system_prompt: Option<&str>) -> Vec<ChatMessage> {
    let system = match system_prompt {
        Some(extra) => format!("{SYSTEM_PROMPT}\n\n{extra}"),
        None => SYSTEM_PROMPT.to_string(),
    };
    let history = if request.scratchpad.trim().is_empty() {
        "Begin.".to_string()
    } else {
        request.scratchpad.clone()
    };
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!(
            "Objective: {}\n\nAvailable tools:\n{}\n\n{}",
            request.objective,
            render_tools(&request.tools),
            history
        )),
    ]
}

fn normalize_tool(name: &str) -> String {
    name.trim()
        .trim_matches('`')
        .trim()
        .to_lowercase()
        .replace(' ', "_")
}

/// Parse a model reply into a thought. A final answer wins over an action;
/// a reply with neither is a pure reasoning step.
pub fn parse_thought(reply: &str) -> Result<Thought> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(ConductorError::LlmParse("empty reply".into()));
    }
    let p = patterns();

    let reasoning_end = p.marker.find(reply).map(|m| m.start()).unwrap_or(reply.len());
    let reasoning = reply[..reasoning_end].trim();
    let text = reasoning
        .strip_prefix("Thought:")
        .or_else(|| reasoning.strip_prefix("thought:"))
        .unwrap_or(reasoning)
        .trim()
        .to_string();

    if let Some(caps) = p.final_answer.captures(reply) {
        return Ok(Thought {
            text,
            action: None,
            final_answer: Some(caps[1].trim().to_string()),
        });
    }

    if let Some(caps) = p.action.captures(reply) {
        let tool = normalize_tool(&caps[1]);
        let input = match p.action_input.captures(reply) {
            Some(c) => {
                let raw = c[1].trim();
                serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .filter(|v| v.is_object())
                    .unwrap_or_else(|| serde_json::json!({ "input": raw }))
            }
            None => serde_json::json!({}),
        };
        return Ok(Thought {
            text,
            action: Some(ChosenAction { tool, input }),
            final_answer: None,
        });
    }

    Ok(Thought::reasoning(text))
}
