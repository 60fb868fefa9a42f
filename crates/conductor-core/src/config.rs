use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: ExecutionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Directory scanned for `*.toml` / `*.json` workflow definitions.
    #[serde(default)]
    pub definitions_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: ExecutionConfig::default(),
            agent: AgentConfig::default(),
            model: None,
            store: None,
            log: None,
            workspace: default_workspace(),
            definitions_dir: None,
        }
    }
}

fn default_workspace() -> String {
    "~/.conductor".to_string()
}

/// Stage scheduling and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running stages within one phase.
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: usize,
    /// Timeout for stages that do not set their own.
    #[serde(default = "default_stage_timeout")]
    pub default_stage_timeout_secs: u64,
    /// Maximum depth of orchestrator stages nesting runs.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
    #[serde(default)]
    pub retry: StageRetryConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: default_max_parallel_stages(),
            default_stage_timeout_secs: default_stage_timeout(),
            max_nesting_depth: default_max_nesting_depth(),
            retry: StageRetryConfig::default(),
        }
    }
}

fn default_max_parallel_stages() -> usize { 8 }
fn default_stage_timeout() -> u64 { 300 }
fn default_max_nesting_depth() -> usize { 8 }

/// Delay between stage retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Re-invoke immediately.
    #[default]
    None,
    /// Exponential backoff with jitter, capped at `max_backoff_ms`.
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRetryConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_stage_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_stage_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for StageRetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::None,
            initial_backoff_ms: default_stage_initial_backoff(),
            max_backoff_ms: default_stage_max_backoff(),
        }
    }
}

fn default_stage_initial_backoff() -> u64 { 500 }
fn default_stage_max_backoff() -> u64 { 10_000 }

/// ReAct agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Cycle budget for agent stages that do not set their own.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Observations longer than this are truncated.
    #[serde(default = "default_observation_max_chars")]
    pub observation_max_chars: usize,
    /// Error observations longer than this are truncated.
    #[serde(default = "default_error_max_chars")]
    pub error_max_chars: usize,
    /// Timeout for a single reasoning step.
    #[serde(default = "default_think_timeout")]
    pub think_timeout_secs: u64,
    /// Optional system prompt prepended to every reasoning request.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            observation_max_chars: default_observation_max_chars(),
            error_max_chars: default_error_max_chars(),
            think_timeout_secs: default_think_timeout(),
            system_prompt: None,
        }
    }
}

fn default_max_cycles() -> u32 { 10 }
fn default_observation_max_chars() -> usize { 2000 }
fn default_error_max_chars() -> usize { 500 }
fn default_think_timeout() -> u64 { 120 }

/// Model used by the LLM reasoning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// SQLite run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. Default: <workspace>/runs.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-stage, 3 = per-agent-cycle (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl EngineConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// SQLite path when a `[store]` section is present.
    pub fn store_path(&self) -> Option<PathBuf> {
        let store = self.store.as_ref()?;
        Some(match &store.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("runs.db"),
        })
    }

    /// Log directory when run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(d) => expand_home(d),
            None => self.workspace_dir().join("logs"),
        })
    }

    pub fn definitions_dir(&self) -> Option<PathBuf> {
        self.definitions_dir.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
