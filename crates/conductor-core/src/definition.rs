use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConductorError, Result, ValidationIssue};
use crate::expr::Expr;

/// Which kind of executor a stage delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Tool,
    Adapter,
    Orchestrator,
    Agent,
    Condition,
    Manual,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Adapter => "adapter",
            Self::Orchestrator => "orchestrator",
            Self::Agent => "agent",
            Self::Condition => "condition",
            Self::Manual => "manual",
        }
    }

    /// Kinds whose `executor` field must name something.
    pub fn requires_executor(&self) -> bool {
        matches!(self, Self::Tool | Self::Adapter | Self::Orchestrator)
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent configuration for `agent` stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Objective template; `{{...}}` references are rendered from the
    /// stage input and run variables.
    pub objective: String,
    /// Overrides the configured cycle budget.
    #[serde(default)]
    pub max_cycles: Option<u32>,
    /// Tool allow-list (empty = every registered tool).
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Where one input value of a stage comes from.
///
/// Written in definitions as plain JSON: `"{{steps.fetch.body}}"`,
/// `"{{vars.customer}}"`, `"{{customer}}"`, `"Hello {{name}}"`, or any
/// literal. A trailing `?` inside the braces marks the reference optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum InputSource {
    Step {
        stage: String,
        path: String,
        optional: bool,
    },
    Variable {
        name: String,
        optional: bool,
    },
    Template(String),
    Literal(Value),
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("static regex"))
}

/// Replace every `{{...}}` reference in `template` with the value `resolve`
/// returns for its inner text. Strings are inserted as-is, other values as
/// JSON, unresolved references as an empty string.
pub fn render_template(template: &str, mut resolve: impl FnMut(&str) -> Option<Value>) -> String {
    reference_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| match resolve(&caps[1]) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

impl InputSource {
    pub fn step(stage: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Step {
            stage: stage.into(),
            path: path.into(),
            optional: false,
        }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable {
            name: name.into(),
            optional: false,
        }
    }

    /// Parse the inside of a `{{...}}` reference.
    pub fn parse_reference(inner: &str) -> std::result::Result<Self, String> {
        let inner = inner.trim();
        let (inner, optional) = match inner.strip_suffix('?') {
            Some(rest) => (rest.trim_end(), true),
            None => (inner, false),
        };
        if inner.is_empty() {
            return Err("empty reference".into());
        }
        if let Some(rest) = inner.strip_prefix("steps.") {
            let (stage, path) = rest.split_once('.').unwrap_or((rest, ""));
            if stage.is_empty() {
                return Err(format!("reference '{inner}' names no stage"));
            }
            return Ok(Self::Step {
                stage: stage.to_string(),
                path: path.to_string(),
                optional,
            });
        }
        let name = inner.strip_prefix("vars.").unwrap_or(inner);
        if name.is_empty() {
            return Err(format!("reference '{inner}' names no variable"));
        }
        Ok(Self::Variable {
            name: name.to_string(),
            optional,
        })
    }

    /// Every reference inside a template string.
    pub fn template_references(template: &str) -> std::result::Result<Vec<InputSource>, String> {
        reference_regex()
            .captures_iter(template)
            .map(|c| Self::parse_reference(&c[1]))
            .collect()
    }

    /// Stage ids this source reads from.
    pub fn stage_refs(&self) -> Vec<String> {
        match self {
            Self::Step { stage, .. } => vec![stage.clone()],
            Self::Template(t) => Self::template_references(t)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|r| match r {
                    Self::Step { stage, .. } => Some(stage),
                    _ => None,
                })
                .collect(),
            Self::Variable { .. } | Self::Literal(_) => Vec::new(),
        }
    }

    fn reference_text(&self) -> Option<String> {
        let mark = |optional: bool| if optional { "?" } else { "" };
        match self {
            Self::Step {
                stage,
                path,
                optional,
            } if path.is_empty() => Some(format!("steps.{stage}{}", mark(*optional))),
            Self::Step {
                stage,
                path,
                optional,
            } => Some(format!("steps.{stage}.{path}{}", mark(*optional))),
            Self::Variable { name, optional } => Some(format!("vars.{name}{}", mark(*optional))),
            _ => None,
        }
    }
}

impl TryFrom<Value> for InputSource {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let Value::String(text) = value else {
            return Ok(Self::Literal(value));
        };
        let trimmed = text.trim();
        let spans: Vec<(usize, usize)> = reference_regex()
            .find_iter(trimmed)
            .map(|m| (m.start(), m.end()))
            .collect();
        if spans.is_empty() {
            return Ok(Self::Literal(Value::String(text)));
        }
        if spans == [(0, trimmed.len())] {
            return Self::parse_reference(&trimmed[2..trimmed.len() - 2]);
        }
        Self::template_references(&text)?;
        Ok(Self::Template(text))
    }
}

impl From<InputSource> for Value {
    fn from(source: InputSource) -> Self {
        if let Some(reference) = source.reference_text() {
            return Value::String(format!("{{{{{reference}}}}}"));
        }
        match source {
            InputSource::Template(t) => Value::String(t),
            InputSource::Literal(v) => v,
            _ => Value::Null,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_inherit_variables() -> bool {
    true
}

/// One configured stage of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique identifier within the definition.
    pub id: String,
    /// Human-readable name (defaults to the id).
    #[serde(default)]
    pub name: String,
    /// Position in the definition; unique.
    pub order: u32,
    pub kind: ExecutorKind,
    /// Tool or adapter id, or the nested definition id for orchestrators.
    #[serde(default)]
    pub executor: String,
    /// Static parameters; mapped inputs are overlaid on top.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, InputSource>,
    /// Run variable name -> path into this stage's output.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
    /// Skip the stage unless this evaluates true.
    #[serde(default)]
    pub condition: Option<String>,
    /// Decision expression for `condition` stages.
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive stages sharing a group run concurrently.
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub agent: Option<AgentSpec>,
    /// Orchestrator stages: copy the parent's variables into the child run.
    #[serde(default = "default_inherit_variables")]
    pub inherit_variables: bool,
}

impl StepSpec {
    /// Create a stage with minimal configuration.
    pub fn new(id: impl Into<String>, kind: ExecutorKind, order: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            order,
            kind,
            executor: String::new(),
            parameters: serde_json::Map::new(),
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            condition: None,
            expression: None,
            continue_on_error: false,
            timeout_secs: None,
            max_retries: default_max_retries(),
            parallel_group: None,
            agent: None,
            inherit_variables: true,
        }
    }

    pub fn tool(id: impl Into<String>, order: u32, executor: impl Into<String>) -> Self {
        Self::new(id, ExecutorKind::Tool, order).with_executor(executor)
    }

    pub fn agent_stage(id: impl Into<String>, order: u32, objective: impl Into<String>) -> Self {
        Self::new(id, ExecutorKind::Agent, order).with_agent(AgentSpec {
            objective: objective.into(),
            max_cycles: None,
            tools: vec![],
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, source: InputSource) -> Self {
        self.input_mapping.insert(key.into(), source);
        self
    }

    pub fn with_output(mut self, variable: impl Into<String>, path: impl Into<String>) -> Self {
        self.output_mapping.insert(variable.into(), path.into());
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_expression(mut self, expr: impl Into<String>) -> Self {
        self.expression = Some(expr.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Immutable, ordered workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stages: Vec<StepSpec>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StepSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Load a definition from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            toml::from_str(&content).map_err(|e| ConductorError::Config(e.to_string()))
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StepSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Stages sorted by order.
    pub fn ordered_stages(&self) -> Vec<&StepSpec> {
        let mut stages: Vec<&StepSpec> = self.stages.iter().collect();
        stages.sort_by_key(|s| s.order);
        stages
    }

    /// Execution phases: consecutive stages sharing a parallel group form
    /// one phase, every other stage is a phase of its own.
    pub fn phases(&self) -> Vec<Vec<&StepSpec>> {
        let mut phases: Vec<Vec<&StepSpec>> = Vec::new();
        for stage in self.ordered_stages() {
            let joins_previous = match (&stage.parallel_group, phases.last()) {
                (Some(group), Some(last)) => last
                    .first()
                    .and_then(|s| s.parallel_group.as_ref())
                    .is_some_and(|g| g == group),
                _ => false,
            };
            match phases.last_mut() {
                Some(last) if joins_previous => last.push(stage),
                _ => phases.push(vec![stage]),
            }
        }
        phases
    }

    /// Check structural invariants, reporting every issue found.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        if self.id.trim().is_empty() {
            issues.push(ValidationIssue::definition("definition id is empty"));
        }
        if self.stages.is_empty() {
            issues.push(ValidationIssue::definition("definition has no stages"));
        }

        let mut ids = HashSet::new();
        let mut orders = HashMap::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                issues.push(ValidationIssue::definition(format!(
                    "stage with order {} has an empty id",
                    stage.order
                )));
            }
            if !ids.insert(stage.id.as_str()) {
                issues.push(ValidationIssue::stage(&stage.id, "duplicate stage id"));
            }
            if let Some(other) = orders.insert(stage.order, stage.id.as_str()) {
                issues.push(ValidationIssue::stage(
                    &stage.id,
                    format!("order {} already used by '{other}'", stage.order),
                ));
            }
        }

        let phases = self.phases();
        let mut phase_of: HashMap<&str, usize> = HashMap::new();
        let mut group_phase: HashMap<&str, usize> = HashMap::new();
        for (index, phase) in phases.iter().enumerate() {
            for stage in phase {
                phase_of.insert(stage.id.as_str(), index);
                if let Some(group) = &stage.parallel_group {
                    if let Some(first) = group_phase.insert(group.as_str(), index) {
                        if first != index {
                            issues.push(ValidationIssue::stage(
                                &stage.id,
                                format!("parallel group '{group}' is not contiguous"),
                            ));
                        }
                    }
                }
            }
            if phase.len() > 1 {
                let mut written: HashMap<&str, &str> = HashMap::new();
                for stage in phase {
                    for key in stage.output_mapping.keys() {
                        if let Some(other) = written.insert(key.as_str(), stage.id.as_str()) {
                            issues.push(ValidationIssue::stage(
                                &stage.id,
                                format!(
                                    "output key '{key}' also written by parallel stage '{other}'"
                                ),
                            ));
                        }
                    }
                }
            }
        }

        for stage in &self.stages {
            self.validate_stage(stage, &phase_of, &mut issues);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConductorError::Validation(issues))
        }
    }

    fn validate_stage(
        &self,
        stage: &StepSpec,
        phase_of: &HashMap<&str, usize>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if stage.kind.requires_executor() && stage.executor.trim().is_empty() {
            issues.push(ValidationIssue::stage(
                &stage.id,
                format!("{} stage has no executor configured", stage.kind),
            ));
        }
        if stage.kind == ExecutorKind::Agent && stage.agent.is_none() {
            issues.push(ValidationIssue::stage(&stage.id, "agent stage has no agent spec"));
        }
        if let Some(agent) = &stage.agent {
            if agent.max_cycles == Some(0) {
                issues.push(ValidationIssue::stage(&stage.id, "max_cycles must be greater than zero"));
            }
        }
        if stage.timeout_secs == Some(0) {
            issues.push(ValidationIssue::stage(&stage.id, "timeout must be greater than zero"));
        }

        let mut referenced: Vec<(String, String)> = Vec::new();
        for (key, source) in &stage.input_mapping {
            if let InputSource::Template(t) = source {
                if let Err(e) = InputSource::template_references(t) {
                    issues.push(ValidationIssue::stage(&stage.id, format!("input '{key}': {e}")));
                }
            }
            for target in source.stage_refs() {
                referenced.push((format!("input '{key}'"), target));
            }
        }

        if stage.kind == ExecutorKind::Condition && stage.expression.is_none() {
            issues.push(ValidationIssue::stage(&stage.id, "condition stage has no expression"));
        }
        for (label, expr) in [("condition", &stage.condition), ("expression", &stage.expression)] {
            let Some(expr) = expr else { continue };
            match Expr::parse(expr) {
                Ok(parsed) => {
                    for path in parsed.paths() {
                        if let Some(rest) = path.strip_prefix("steps.") {
                            let target = rest.split('.').next().unwrap_or_default();
                            referenced.push((label.to_string(), target.to_string()));
                        }
                    }
                }
                Err(e) => issues.push(ValidationIssue::stage(&stage.id, e.to_string())),
            }
        }

        for (label, target) in referenced {
            let Some(source) = self.stage(&target) else {
                issues.push(ValidationIssue::stage(
                    &stage.id,
                    format!("{label} references unknown stage '{target}'"),
                ));
                continue;
            };
            if source.order >= stage.order {
                issues.push(ValidationIssue::stage(
                    &stage.id,
                    format!("{label} references later stage '{target}'"),
                ));
            } else if phase_of.get(target.as_str()) == phase_of.get(stage.id.as_str()) {
                issues.push(ValidationIssue::stage(
                    &stage.id,
                    format!("{label} references '{target}' in the same parallel phase"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issues_of(def: &WorkflowDefinition) -> Vec<String> {
        match def.validate() {
            Err(ConductorError::Validation(issues)) => {
                issues.into_iter().map(|i| i.to_string()).collect()
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(()) => vec![],
        }
    }

    #[test]
    fn test_input_source_parsing() {
        let src: InputSource = serde_json::from_value(json!("{{steps.fetch.body.id}}")).unwrap();
        assert_eq!(src, InputSource::step("fetch", "body.id"));

        let src: InputSource = serde_json::from_value(json!("{{ customer? }}")).unwrap();
        assert_eq!(
            src,
            InputSource::Variable {
                name: "customer".into(),
                optional: true
            }
        );

        let src: InputSource = serde_json::from_value(json!("{{vars.region}}")).unwrap();
        assert_eq!(src, InputSource::variable("region"));

        let src: InputSource = serde_json::from_value(json!("Hi {{name}} from {{steps.a}}")).unwrap();
        assert!(matches!(src, InputSource::Template(_)));
        assert_eq!(src.stage_refs(), vec!["a".to_string()]);

        let src: InputSource = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(src, InputSource::Literal(json!(42)));

        assert!(serde_json::from_value::<InputSource>(json!("{{steps.}}")).is_err());
    }

    #[test]
    fn test_render_template() {
        let vars = json!({ "name": "Ada", "count": 2 });
        let out = render_template("Hi {{name}}, {{ count }} items{{missing}}", |r| {
            crate::expr::lookup_path(&vars, r).cloned()
        });
        assert_eq!(out, "Hi Ada, 2 items");
    }

    #[test]
    fn test_input_source_serializes_back() {
        let value: Value = InputSource::step("a", "").into();
        assert_eq!(value, json!("{{steps.a}}"));
        let value: Value = InputSource::Variable {
            name: "x".into(),
            optional: true,
        }
        .into();
        assert_eq!(value, json!("{{vars.x?}}"));
    }

    #[test]
    fn test_phases_group_consecutive_stages() {
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("c", 3, "echo").in_group("g"))
            .with_stage(StepSpec::tool("a", 1, "echo"))
            .with_stage(StepSpec::tool("b", 2, "echo").in_group("g"))
            .with_stage(StepSpec::tool("d", 4, "echo"));
        let phases: Vec<Vec<&str>> = def
            .phases()
            .iter()
            .map(|p| p.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(phases, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_valid_definition() {
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("a", 1, "echo").with_output("x", "value"))
            .with_stage(
                StepSpec::tool("b", 2, "echo")
                    .with_input("v", InputSource::step("a", "value"))
                    .with_condition("x == 1"),
            );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_duplicate_order_and_id() {
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("a", 1, "echo"))
            .with_stage(StepSpec::tool("a", 1, "echo"));
        let issues = issues_of(&def);
        assert!(issues.iter().any(|i| i.contains("duplicate stage id")));
        assert!(issues.iter().any(|i| i.contains("order 1 already used")));
    }

    #[test]
    fn test_forward_and_unknown_references() {
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("a", 1, "echo").with_input("v", InputSource::step("b", "")))
            .with_stage(StepSpec::tool("b", 2, "echo").with_input("v", InputSource::step("zz", "")));
        let issues = issues_of(&def);
        assert!(issues.iter().any(|i| i.contains("later stage 'b'")));
        assert!(issues.iter().any(|i| i.contains("unknown stage 'zz'")));
    }

    #[test]
    fn test_parallel_group_rules() {
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::tool("a", 1, "echo").in_group("g").with_output("k", "$"))
            .with_stage(
                StepSpec::tool("b", 2, "echo")
                    .in_group("g")
                    .with_output("k", "$")
                    .with_input("v", InputSource::step("a", "")),
            )
            .with_stage(StepSpec::tool("c", 3, "echo"))
            .with_stage(StepSpec::tool("d", 4, "echo").in_group("g"));
        let issues = issues_of(&def);
        assert!(issues.iter().any(|i| i.contains("output key 'k'")));
        assert!(issues.iter().any(|i| i.contains("same parallel phase")));
        assert!(issues.iter().any(|i| i.contains("not contiguous")));
    }

    #[test]
    fn test_kind_specific_requirements() {
        let def = WorkflowDefinition::new("wf", "Workflow")
            .with_stage(StepSpec::new("t", ExecutorKind::Tool, 1))
            .with_stage(StepSpec::new("g", ExecutorKind::Agent, 2))
            .with_stage(StepSpec::new("c", ExecutorKind::Condition, 3))
            .with_stage(StepSpec::tool("x", 4, "echo").with_timeout(0).with_condition("a =="));
        let issues = issues_of(&def);
        assert!(issues.iter().any(|i| i.contains("no executor configured")));
        assert!(issues.iter().any(|i| i.contains("no agent spec")));
        assert!(issues.iter().any(|i| i.contains("no expression")));
        assert!(issues.iter().any(|i| i.contains("timeout must be greater than zero")));
        assert!(issues.iter().any(|i| i.contains("Invalid expression")));
    }

    #[test]
    fn test_load_toml_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.toml");
        std::fs::write(
            &path,
            r#"
id = "onboarding"
name = "Onboarding"

[[stages]]
id = "lookup"
order = 1
kind = "tool"
executor = "echo"
output_mapping = { account = "account" }

[[stages]]
id = "notify"
order = 2
kind = "tool"
executor = "echo"
max_retries = 1
input_mapping = { target = "{{steps.lookup.account}}", note = "Welcome {{name}}" }
"#,
        )
        .unwrap();
        let def = WorkflowDefinition::load(&path).unwrap();
        assert_eq!(def.stages.len(), 2);
        let notify = def.stage("notify").unwrap();
        assert_eq!(notify.max_retries, 1);
        assert_eq!(notify.name, "");
        assert_eq!(notify.display_name(), "notify");
        assert_eq!(
            notify.input_mapping.get("target"),
            Some(&InputSource::step("lookup", "account"))
        );
        assert!(def.validate().is_ok());
    }
}
