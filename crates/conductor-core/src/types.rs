use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Running or paused runs count as active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Allowed tracker transitions.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of a stage's executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Tracker record for one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub stage_id: String,
    pub stage_name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl StepExecution {
    pub fn pending(stage_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            stage_name: stage_name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            input: None,
            output: None,
            log: Vec::new(),
            error: None,
            retry_count: 0,
            cost: 0.0,
            attempts: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

/// Authoritative record of one run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunExecution {
    pub id: RunId,
    pub definition_id: String,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub results: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
    /// Stage records in definition order.
    #[serde(default)]
    pub steps: Vec<StepExecution>,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub initiated_by: String,
}

impl RunExecution {
    pub fn step(&self, stage_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn step_mut(&mut self, stage_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.stage_id == stage_id)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let end = self.completed_at?;
        Some((end - self.started_at).num_milliseconds().max(0) as u64)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            definition_id: self.definition_id.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms(),
            initiated_by: self.initiated_by.clone(),
            total_cost: self.total_cost,
            has_errors: self.has_errors(),
        }
    }

    pub fn progress(&self) -> RunProgress {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        let total = self.steps.len();
        let completed = count(StepStatus::Completed);
        let failed = count(StepStatus::Failed);
        let skipped = count(StepStatus::Skipped);
        let finished = completed + failed + skipped;
        let current_stage = self
            .steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Running | StepStatus::Retrying))
            .map(|s| s.stage_name.clone());
        let percent = if total == 0 {
            0.0
        } else {
            (finished as f64 / total as f64) * 100.0
        };

        RunProgress {
            run_id: self.id.clone(),
            status: self.status,
            total_stages: total,
            completed,
            failed,
            skipped,
            current_stage,
            percent,
        }
    }
}

/// Compact view of a run for history listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub definition_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub initiated_by: String,
    pub total_cost: f64,
    pub has_errors: bool,
}

/// Stage counts for a run in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total_stages: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current_stage: Option<String>,
    pub percent: f64,
}

/// Normalized result of an executor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOutput {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cost: f64,
}

impl ExecutorOutput {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            cost: 0.0,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error_message: Some(message.into()),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// A tool call chosen by the reasoning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenAction {
    pub tool: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// One reasoning step returned by the reasoning backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Thought {
    pub text: String,
    #[serde(default)]
    pub action: Option<ChosenAction>,
    #[serde(default)]
    pub final_answer: Option<String>,
}

impl Thought {
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn act(text: impl Into<String>, tool: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            text: text.into(),
            action: Some(ChosenAction {
                tool: tool.into(),
                input,
            }),
            final_answer: None,
        }
    }

    pub fn answer(text: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: None,
            final_answer: Some(answer.into()),
        }
    }
}

/// Context handed to an executor for one invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: RunId,
    pub stage_id: String,
    pub attempt: u32,
    pub working_dir: std::path::PathBuf,
}

/// Tool advertised to a reasoning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Input to one reasoning step.
#[derive(Debug, Clone)]
pub struct ThinkRequest {
    pub objective: String,
    /// Rendered scratchpad so far.
    pub scratchpad: String,
    pub tools: Vec<ToolDescriptor>,
    pub cycle: u32,
}

/// Role in a chat exchange with the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }
}

/// Run and stage transitions broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Run record created and marked running.
    RunStarted {
        run_id: RunId,
        definition_id: String,
        parent_run_id: Option<RunId>,
    },
    /// A stage attempt started.
    StageStarted {
        run_id: RunId,
        stage_id: String,
        attempt: u32,
    },
    /// A stage attempt failed and will be retried.
    StageRetrying {
        run_id: RunId,
        stage_id: String,
        retry_count: u32,
        error: String,
    },
    /// A stage completed successfully.
    StageCompleted {
        run_id: RunId,
        stage_id: String,
        duration_ms: u64,
    },
    /// A stage failed after exhausting its retries.
    StageFailed {
        run_id: RunId,
        stage_id: String,
        error: String,
    },
    /// A stage's condition evaluated false.
    StageSkipped { run_id: RunId, stage_id: String },
    /// An agent stage produced a thought.
    AgentThought {
        run_id: RunId,
        stage_id: String,
        cycle: u32,
        text: String,
    },
    /// An agent stage executed a tool action.
    AgentAction {
        run_id: RunId,
        stage_id: String,
        cycle: u32,
        tool: String,
        success: bool,
    },
    RunPaused { run_id: RunId },
    RunResumed { run_id: RunId },
    /// Run reached a terminal status.
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        total_cost: f64,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageRetrying { run_id, .. }
            | Self::StageCompleted { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::StageSkipped { run_id, .. }
            | Self::AgentThought { run_id, .. }
            | Self::AgentAction { run_id, .. }
            | Self::RunPaused { run_id }
            | Self::RunResumed { run_id }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}
