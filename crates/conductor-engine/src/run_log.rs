use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use conductor_core::event::EventBus;
use conductor_core::types::{RunEvent, RunId};

/// JSONL run trail writer.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines already written survive a crash.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(run_id: &RunId, event_type: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            stage_id: None,
            detail: None,
        }
    }

    fn stage(mut self, stage_id: &str) -> Self {
        self.stage_id = Some(stage_id.to_string());
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=per-stage, 3=per-agent-cycle.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task until cancellation or the bus
    /// closes. Each run's file is closed when the run finishes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut rx = event_bus.subscribe();
        let mut writers: HashMap<RunId, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            let run_id = event.run_id().clone();
                            self.write(&mut writers, &run_id, &entry).await;

                            if matches!(event, RunEvent::RunFinished { .. }) {
                                if let Some(mut writer) = writers.remove(&run_id) {
                                    writer.flush().await.ok();
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{run_id}.jsonl"))
    }

    async fn write(
        &self,
        writers: &mut HashMap<RunId, BufWriter<File>>,
        run_id: &RunId,
        entry: &LogEntry,
    ) {
        if !writers.contains_key(run_id) {
            let path = self.log_path(run_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    writers.insert(run_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open log file");
                    return;
                }
            }
        }
        let Some(writer) = writers.get_mut(run_id) else {
            return;
        };
        let Ok(json) = serde_json::to_string(entry) else {
            return;
        };
        let line = format!("{json}\n");
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(run_id = %run_id, error = %e, "Failed to write log entry");
            return;
        }
        // Flush after each entry for crash resilience
        if let Err(e) = writer.flush().await {
            error!(run_id = %run_id, error = %e, "Failed to flush log");
        }
    }

    /// Convert a RunEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        match event {
            // L1: run summary
            RunEvent::RunStarted {
                run_id,
                definition_id,
                parent_run_id,
            } => Some(LogEntry::new(run_id, "run_started").detail(serde_json::json!({
                "definition_id": definition_id,
                "parent_run_id": parent_run_id,
            }))),
            RunEvent::RunFinished {
                run_id,
                status,
                duration_ms,
                total_cost,
            } => Some(LogEntry::new(run_id, "run_finished").detail(serde_json::json!({
                "status": status,
                "duration_ms": duration_ms,
                "total_cost": total_cost,
            }))),

            // L2: stage transitions
            RunEvent::StageStarted {
                run_id,
                stage_id,
                attempt,
            } if self.level >= 2 => Some(
                LogEntry::new(run_id, "stage_started")
                    .stage(stage_id)
                    .detail(serde_json::json!({ "attempt": attempt })),
            ),
            RunEvent::StageRetrying {
                run_id,
                stage_id,
                retry_count,
                error,
            } if self.level >= 2 => Some(
                LogEntry::new(run_id, "stage_retrying")
                    .stage(stage_id)
                    .detail(serde_json::json!({
                        "retry_count": retry_count,
                        "error": truncate_str(error, 500),
                    })),
            ),
            RunEvent::StageCompleted {
                run_id,
                stage_id,
                duration_ms,
            } if self.level >= 2 => Some(
                LogEntry::new(run_id, "stage_completed")
                    .stage(stage_id)
                    .detail(serde_json::json!({ "duration_ms": duration_ms })),
            ),
            RunEvent::StageFailed {
                run_id,
                stage_id,
                error,
            } if self.level >= 2 => Some(
                LogEntry::new(run_id, "stage_failed")
                    .stage(stage_id)
                    .detail(serde_json::json!({ "error": truncate_str(error, 500) })),
            ),
            RunEvent::StageSkipped { run_id, stage_id } if self.level >= 2 => {
                Some(LogEntry::new(run_id, "stage_skipped").stage(stage_id))
            }
            RunEvent::RunPaused { run_id } if self.level >= 2 => {
                Some(LogEntry::new(run_id, "run_paused"))
            }
            RunEvent::RunResumed { run_id } if self.level >= 2 => {
                Some(LogEntry::new(run_id, "run_resumed"))
            }

            // L3: agent cycles
            RunEvent::AgentThought {
                run_id,
                stage_id,
                cycle,
                text,
            } if self.level >= 3 => Some(
                LogEntry::new(run_id, "agent_thought")
                    .stage(stage_id)
                    .detail(serde_json::json!({
                        "cycle": cycle,
                        "text": truncate_str(text, 200),
                    })),
            ),
            RunEvent::AgentAction {
                run_id,
                stage_id,
                cycle,
                tool,
                success,
            } if self.level >= 3 => Some(
                LogEntry::new(run_id, "agent_action")
                    .stage(stage_id)
                    .detail(serde_json::json!({
                        "cycle": cycle,
                        "tool": tool,
                        "success": success,
                    })),
            ),

            _ => None,
        }
    }
}

/// Truncate a string for logging, respecting char boundaries.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
