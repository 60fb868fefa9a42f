//! Resolution of stage inputs from prior outputs and run variables, and
//! application of output mappings back into the run.

use serde_json::{Map, Value};

use conductor_core::definition::{render_template, InputSource, StepSpec};
use conductor_core::error::{ConductorError, Result};
use conductor_core::expr::lookup_path;

use crate::context::ExecutionContext;

/// Build a stage's input: its static parameters overlaid by mapped values.
pub fn resolve_input(stage: &StepSpec, ctx: &ExecutionContext) -> Result<Value> {
    let mut params = stage.parameters.clone();
    for (key, source) in &stage.input_mapping {
        let value = resolve_source(source, ctx).map_err(|reason| {
            ConductorError::InvalidInputMapping {
                stage: stage.id.clone(),
                key: key.clone(),
                reason,
            }
        })?;
        params.insert(key.clone(), value);
    }
    Ok(Value::Object(params))
}

fn lookup_reference(source: &InputSource, ctx: &ExecutionContext) -> Option<Value> {
    match source {
        InputSource::Step { stage, path, .. } => {
            let output = ctx.step_output(stage)?;
            lookup_path(&output, path).cloned()
        }
        InputSource::Variable { name, .. } => {
            let (head, rest) = name.split_once('.').unwrap_or((name.as_str(), ""));
            let value = ctx.variable(head)?;
            lookup_path(&value, rest).cloned()
        }
        InputSource::Template(_) | InputSource::Literal(_) => None,
    }
}

fn describe(source: &InputSource) -> String {
    match source {
        InputSource::Step { stage, path, .. } if path.is_empty() => {
            format!("stage '{stage}' has no output")
        }
        InputSource::Step { stage, path, .. } => {
            format!("stage '{stage}' produced no value at '{path}'")
        }
        InputSource::Variable { name, .. } => format!("variable '{name}' is not set"),
        _ => "unresolved reference".to_string(),
    }
}

fn is_optional(source: &InputSource) -> bool {
    matches!(
        source,
        InputSource::Step { optional: true, .. } | InputSource::Variable { optional: true, .. }
    )
}

fn resolve_source(source: &InputSource, ctx: &ExecutionContext) -> std::result::Result<Value, String> {
    match source {
        InputSource::Literal(value) => Ok(value.clone()),
        InputSource::Template(template) => {
            let mut missing = Vec::new();
            let text = render_template(template, |inner| {
                let reference = match InputSource::parse_reference(inner) {
                    Ok(r) => r,
                    Err(e) => {
                        missing.push(e);
                        return None;
                    }
                };
                let value = lookup_reference(&reference, ctx);
                if value.is_none() && !is_optional(&reference) {
                    missing.push(describe(&reference));
                }
                value
            });
            if missing.is_empty() {
                Ok(Value::String(text))
            } else {
                Err(missing.join("; "))
            }
        }
        reference => match lookup_reference(reference, ctx) {
            Some(value) => Ok(value),
            None if is_optional(reference) => Ok(Value::Null),
            None => Err(describe(reference)),
        },
    }
}

/// Render an agent objective. References look in the stage input first,
/// then run variables and stage outputs; unresolved ones render empty.
pub fn render_objective(objective: &str, input: &Value, ctx: &ExecutionContext) -> String {
    render_template(objective, |inner| {
        let inner = inner.trim().trim_end_matches('?');
        if let Some(value) = lookup_path(input, inner) {
            return Some(value.clone());
        }
        InputSource::parse_reference(inner)
            .ok()
            .and_then(|r| lookup_reference(&r, ctx))
    })
}

/// Write a stage's mapped outputs into the run variables.
pub fn apply_output(stage: &StepSpec, output: &Value, ctx: &ExecutionContext) -> Result<()> {
    let mut resolved = Map::new();
    for (variable, path) in &stage.output_mapping {
        let value = lookup_path(output, path).ok_or_else(|| ConductorError::InvalidOutputMapping {
            stage: stage.id.clone(),
            key: variable.clone(),
            reason: format!("output has no value at '{path}'"),
        })?;
        resolved.insert(variable.clone(), value.clone());
    }
    for (variable, value) in resolved {
        ctx.set_variable(variable, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::types::RunId;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecutionContext {
        let mut vars = Map::new();
        vars.insert("customer".into(), json!({"name": "Acme", "tier": 2}));
        let ctx = ExecutionContext::new(RunId::from_str("r1"), vars, CancellationToken::new());
        ctx.record_output("fetch", json!({"body": {"items": [10, 20]}, "status": 200}));
        ctx
    }

    #[test]
    fn test_mapped_values_overlay_parameters() {
        let stage = StepSpec::tool("b", 2, "echo")
            .with_param("status", json!("static"))
            .with_param("limit", json!(5))
            .with_input("status", InputSource::step("fetch", "status"))
            .with_input("first", InputSource::step("fetch", "body.items.0"))
            .with_input("who", InputSource::variable("customer.name"));
        let input = resolve_input(&stage, &ctx()).unwrap();
        assert_eq!(
            input,
            json!({"status": 200, "limit": 5, "first": 10, "who": "Acme"})
        );
    }

    #[test]
    fn test_template_and_literal_sources() {
        let stage = StepSpec::tool("b", 2, "echo")
            .with_input(
                "greeting",
                InputSource::Template("Hello {{customer.name}}, tier {{vars.customer.tier}}".into()),
            )
            .with_input("flag", InputSource::Literal(json!(true)));
        let input = resolve_input(&stage, &ctx()).unwrap();
        assert_eq!(input["greeting"], json!("Hello Acme, tier 2"));
        assert_eq!(input["flag"], json!(true));
    }

    #[test]
    fn test_missing_required_reference_is_configuration_error() {
        let stage = StepSpec::tool("b", 2, "echo").with_input("x", InputSource::step("fetch", "nope"));
        let err = resolve_input(&stage, &ctx()).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidInputMapping { ref key, .. } if key == "x"));
        assert_eq!(err.kind(), conductor_core::ErrorKind::Configuration);
    }

    #[test]
    fn test_optional_reference_resolves_to_null() {
        let source = InputSource::try_from(json!("{{steps.missing.value?}}")).unwrap();
        let stage = StepSpec::tool("b", 2, "echo").with_input("x", source);
        let input = resolve_input(&stage, &ctx()).unwrap();
        assert_eq!(input["x"], Value::Null);
    }

    #[test]
    fn test_template_with_missing_required_reference_fails() {
        let stage = StepSpec::tool("b", 2, "echo")
            .with_input("t", InputSource::Template("id={{order_id}}".into()));
        assert!(resolve_input(&stage, &ctx()).is_err());
    }

    #[test]
    fn test_apply_output_writes_variables() {
        let ctx = ctx();
        let stage = StepSpec::tool("b", 2, "echo")
            .with_output("items", "body.items")
            .with_output("everything", "$");
        let output = json!({"body": {"items": [1]}});
        apply_output(&stage, &output, &ctx).unwrap();
        assert_eq!(ctx.variable("items"), Some(json!([1])));
        assert_eq!(ctx.variable("everything"), Some(output));
    }

    #[test]
    fn test_apply_output_missing_path_writes_nothing() {
        let ctx = ctx();
        let stage = StepSpec::tool("b", 2, "echo")
            .with_output("a", "present")
            .with_output("b", "absent");
        let err = apply_output(&stage, &json!({"present": 1}), &ctx).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidOutputMapping { .. }));
        assert!(ctx.variable("a").is_none());
    }

    #[test]
    fn test_render_objective_prefers_input() {
        let objective = "Summarize {{topic}} for {{customer.name}} using {{steps.fetch.status}}";
        let text = render_objective(objective, &json!({"topic": "sales"}), &ctx());
        assert_eq!(text, "Summarize sales for Acme using 200");
    }
}
