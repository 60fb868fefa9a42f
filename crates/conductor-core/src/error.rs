use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure, used by the controller to decide
/// between retrying, continuing, and halting a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Transient,
    Timeout,
    BudgetExhausted,
    AgentExecution,
    NestedRun,
    Cancelled,
    NotFound,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::BudgetExhausted => "budget_exhausted",
            Self::AgentExecution => "agent_execution",
            Self::NestedRun => "nested_run",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }

    /// Whether a stage failing with this kind may be invoked again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::AgentExecution | Self::NestedRun
        )
    }

    /// Configuration failures stop the run even when the stage allows
    /// continuing on error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration | Self::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error payload attached to step and run records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorDetail>>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            run_id: None,
            stage_id: None,
            cause: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    /// Innermost cause in the chain (self when there is none).
    pub fn root_cause(&self) -> &ErrorDetail {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

/// One problem found while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn definition(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            message: message.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "stage '{stage}': {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ConductorError {
    // Configuration errors
    #[error("Unsupported executor: {kind} '{executor}'")]
    UnsupportedExecutor { kind: String, executor: String },

    #[error("Stage '{stage}' has no executor configured")]
    NoExecutorConfigured { stage: String },

    #[error("Invalid input mapping for stage '{stage}', key '{key}': {reason}")]
    InvalidInputMapping {
        stage: String,
        key: String,
        reason: String,
    },

    #[error("Invalid output mapping for stage '{stage}', key '{key}': {reason}")]
    InvalidOutputMapping {
        stage: String,
        key: String,
        reason: String,
    },

    #[error("Invalid parameters for stage '{stage}': {reason}")]
    InvalidParameters { stage: String, reason: String },

    #[error("Invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("Nested runs exceed maximum depth ({0})")]
    NestingTooDeep(usize),

    #[error("No reasoning backend configured for agent stage '{0}'")]
    NoReasoningBackend(String),

    // Validation errors
    #[error("Definition validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    // Execution errors
    #[error("Executor failed: {executor}: {message}")]
    ExecutorFailed { executor: String, message: String },

    #[error("Executor '{executor}' timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    Timeout {
        executor: String,
        timeout_ms: u64,
        elapsed_ms: u64,
    },

    #[error("Agent exhausted its budget of {0} cycles")]
    BudgetExhausted(u32),

    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    #[error("Nested run {child_run_id} failed: {}", .cause.message)]
    NestedRun {
        child_run_id: String,
        cause: Box<ErrorDetail>,
    },

    #[error("Run cancelled")]
    Cancelled,

    // Lookup and state errors
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} has no stage '{stage}'")]
    StageNotFound { run_id: String, stage: String },

    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("Stage '{stage}' exceeded its retry limit ({max_retries})")]
    RetryLimitExceeded { stage: String, max_retries: u32 },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedExecutor { .. }
            | Self::NoExecutorConfigured { .. }
            | Self::InvalidInputMapping { .. }
            | Self::InvalidOutputMapping { .. }
            | Self::InvalidParameters { .. }
            | Self::InvalidExpression { .. }
            | Self::NestingTooDeep(_)
            | Self::NoReasoningBackend(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::ExecutorFailed { .. } | Self::LlmRequest(_) => ErrorKind::Transient,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            Self::AgentExecution(_) | Self::LlmParse(_) => ErrorKind::AgentExecution,
            Self::NestedRun { .. } => ErrorKind::NestedRun,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DefinitionNotFound(_) | Self::RunNotFound(_) | Self::StageNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::Database(_) => ErrorKind::Storage,
            Self::InvalidTransition { .. }
            | Self::RetryLimitExceeded { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Capture this error as a serializable payload. Nested-run failures
    /// keep the child's detail as the cause.
    pub fn to_detail(&self) -> ErrorDetail {
        let mut detail = ErrorDetail::new(self.kind(), self.to_string());
        if let Self::NestedRun {
            child_run_id,
            cause,
        } = self
        {
            detail.cause = Some(Box::new(
                cause.as_ref().clone().with_run(child_run_id.clone()),
            ));
        }
        detail
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = ConductorError::UnsupportedExecutor {
            kind: "tool".into(),
            executor: "missing".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());

        let err = ConductorError::Timeout {
            executor: "slow".into(),
            timeout_ms: 100,
            elapsed_ms: 101,
        };
        assert!(err.is_retryable());
        assert!(!ConductorError::BudgetExhausted(5).is_retryable());
        assert!(!ConductorError::Cancelled.is_retryable());
    }

    #[test]
    fn test_nested_detail_preserves_cause() {
        let inner = ErrorDetail::new(ErrorKind::Timeout, "slow tool").with_stage("fetch");
        let err = ConductorError::NestedRun {
            child_run_id: "child-1".into(),
            cause: Box::new(inner),
        };
        let detail = err.to_detail();
        assert_eq!(detail.kind, ErrorKind::NestedRun);
        let cause = detail.cause.as_deref().unwrap();
        assert_eq!(cause.kind, ErrorKind::Timeout);
        assert_eq!(cause.run_id.as_deref(), Some("child-1"));
        assert_eq!(cause.stage_id.as_deref(), Some("fetch"));
        assert_eq!(detail.root_cause().message, "slow tool");
    }

    #[test]
    fn test_validation_message_lists_issues() {
        let err = ConductorError::Validation(vec![
            ValidationIssue::definition("no stages"),
            ValidationIssue::stage("b", "duplicate order 2"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("no stages"));
        assert!(msg.contains("stage 'b': duplicate order 2"));
    }
}
