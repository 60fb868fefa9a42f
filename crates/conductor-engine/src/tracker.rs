use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use conductor_core::definition::WorkflowDefinition;
use conductor_core::error::{ConductorError, ErrorDetail, ErrorKind, Result};
use conductor_core::event::EventBus;
use conductor_core::traits::PersistenceSink;
use conductor_core::types::{
    AttemptRecord, RunEvent, RunExecution, RunId, RunProgress, RunStatus, RunSummary,
    StepExecution, StepStatus,
};

use crate::invoker::StepResult;

type RunRecord = Arc<tokio::sync::Mutex<RunExecution>>;

/// What to write to the sink after a mutation.
enum Persist {
    Run,
    Step(String),
}

/// Authoritative record of every run and stage.
///
/// Mutations of one run are serialized by that run's mutex. Each mutation
/// is persisted while the lock is held and its event is published after the
/// lock is released.
pub struct ExecutionTracker {
    runs: Mutex<HashMap<RunId, RunRecord>>,
    sink: Arc<dyn PersistenceSink>,
    event_bus: Arc<EventBus>,
}

impl ExecutionTracker {
    pub fn new(sink: Arc<dyn PersistenceSink>, event_bus: Arc<EventBus>) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            sink,
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn record(&self, run_id: &RunId) -> Result<RunRecord> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))
    }

    /// Write to the sink. Returns false when the sink rejected the write.
    async fn persist(&self, run: &RunExecution, what: &Persist) -> bool {
        let result = match what {
            Persist::Run => self.sink.save_run(run).await,
            Persist::Step(stage_id) => match run.step(stage_id) {
                Some(step) => self.sink.save_step(&run.id, step).await,
                None => Ok(()),
            },
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to persist run state");
                false
            }
        }
    }

    async fn mutate<T, F>(&self, run_id: &RunId, what: Persist, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut RunExecution) -> Result<(T, Option<RunEvent>)> + Send,
    {
        self.apply(run_id, what, f).await.map(|(value, _)| value)
    }

    /// Apply a mutation, persist it, then publish its event. Also reports
    /// whether the sink accepted the write.
    async fn apply<T, F>(&self, run_id: &RunId, what: Persist, f: F) -> Result<(T, bool)>
    where
        T: Send,
        F: FnOnce(&mut RunExecution) -> Result<(T, Option<RunEvent>)> + Send,
    {
        let record = self.record(run_id)?;
        let (value, event, persisted) = {
            let mut run = record.lock().await;
            let (value, event) = f(&mut run)?;
            let persisted = self.persist(&run, &what).await;
            (value, event, persisted)
        };
        if let Some(event) = event {
            self.event_bus.publish(event);
        }
        Ok((value, persisted))
    }

    /// Create a Pending run record with one pending stage record per stage.
    pub async fn begin(
        &self,
        definition: &WorkflowDefinition,
        initiated_by: &str,
        variables: Map<String, Value>,
        parent_run_id: Option<RunId>,
    ) -> Result<RunExecution> {
        let run = RunExecution {
            id: RunId::new(),
            definition_id: definition.id.clone(),
            parent_run_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_cost: 0.0,
            results: BTreeMap::new(),
            errors: Vec::new(),
            steps: definition
                .ordered_stages()
                .into_iter()
                .map(|s| StepExecution::pending(&s.id, s.display_name()))
                .collect(),
            variables,
            initiated_by: initiated_by.to_string(),
        };

        self.persist(&run, &Persist::Run).await;
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id.clone(), Arc::new(tokio::sync::Mutex::new(run.clone())));
        debug!(run_id = %run.id, definition = %run.definition_id, "Run created");
        Ok(run)
    }

    /// Move a run between non-terminal statuses.
    pub async fn set_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        self.mutate(run_id, Persist::Run, |run| {
            let from = run.status;
            if status.is_terminal() || !from.can_transition_to(status) {
                return Err(invalid_transition(run, from.as_str(), status.as_str()));
            }
            run.status = status;
            let event = match (from, status) {
                (RunStatus::Pending, RunStatus::Running) => RunEvent::RunStarted {
                    run_id: run.id.clone(),
                    definition_id: run.definition_id.clone(),
                    parent_run_id: run.parent_run_id.clone(),
                },
                (RunStatus::Paused, RunStatus::Running) => RunEvent::RunResumed {
                    run_id: run.id.clone(),
                },
                _ => RunEvent::RunPaused {
                    run_id: run.id.clone(),
                },
            };
            Ok(((), Some(event)))
        })
        .await
    }

    /// Begin an attempt of a stage. Returns the 1-based attempt number.
    pub async fn record_stage_start(
        &self,
        run_id: &RunId,
        stage_id: &str,
        input: &Value,
        timeout_ms: Option<u64>,
    ) -> Result<u32> {
        let input = input.clone();
        self.mutate(run_id, Persist::Step(stage_id.to_string()), |run| {
            let step = open_step(run, stage_id, StepStatus::Running)?;
            let now = Utc::now();
            step.started_at.get_or_insert(now);
            step.input = Some(input);
            step.status = StepStatus::Running;
            let attempt = step.attempts.len() as u32 + 1;
            step.attempts.push(AttemptRecord {
                attempt,
                started_at: now,
                elapsed_ms: 0,
                timeout_ms,
                error: None,
            });
            let event = RunEvent::StageStarted {
                run_id: run.id.clone(),
                stage_id: stage_id.to_string(),
                attempt,
            };
            Ok((attempt, Some(event)))
        })
        .await
    }

    /// Record a failed attempt that the controller will retry. Rejects the
    /// retry when it would exceed `max_retries`. Returns the new retry count.
    pub async fn record_attempt_failed(
        &self,
        run_id: &RunId,
        stage_id: &str,
        error: ErrorDetail,
        log: Vec<String>,
        elapsed_ms: u64,
        max_retries: u32,
    ) -> Result<u32> {
        self.mutate(run_id, Persist::Step(stage_id.to_string()), |run| {
            let step = open_step(run, stage_id, StepStatus::Retrying)?;
            if step.retry_count >= max_retries {
                return Err(ConductorError::RetryLimitExceeded {
                    stage: stage_id.to_string(),
                    max_retries,
                });
            }
            let message = error.message.clone();
            if let Some(attempt) = step.attempts.last_mut() {
                attempt.elapsed_ms = elapsed_ms;
                attempt.error = Some(error);
            }
            step.retry_count += 1;
            step.status = StepStatus::Retrying;
            step.log.extend(log);
            step.log.push(format!(
                "attempt {} failed: {message}",
                step.attempts.len()
            ));
            let retry_count = step.retry_count;
            let event = RunEvent::StageRetrying {
                run_id: run.id.clone(),
                stage_id: stage_id.to_string(),
                retry_count,
                error: message,
            };
            Ok((retry_count, Some(event)))
        })
        .await
    }

    /// Record the final outcome of a stage.
    pub async fn record_stage_end(
        &self,
        run_id: &RunId,
        stage_id: &str,
        result: StepResult,
        elapsed_ms: u64,
    ) -> Result<()> {
        self.mutate(run_id, Persist::Run, |run| {
            let status = match (&result.error, result.success) {
                (_, true) => StepStatus::Completed,
                (Some(e), false) if e.kind == ErrorKind::Cancelled => StepStatus::Cancelled,
                _ => StepStatus::Failed,
            };
            let run_id = run.id.clone();
            let step = open_step(run, stage_id, status)?;
            let now = Utc::now();
            step.started_at.get_or_insert(now);
            step.completed_at = Some(now);
            step.status = status;
            step.cost += result.cost;
            step.log.extend(result.log);
            // An attempt already closed by a retry keeps its own error.
            if let Some(attempt) = step.attempts.last_mut().filter(|a| a.error.is_none()) {
                attempt.elapsed_ms = elapsed_ms;
                attempt.error = result.error.clone();
            }
            let duration_ms = step.duration_ms().unwrap_or(elapsed_ms);
            let failure = match status {
                StepStatus::Completed => {
                    step.output = Some(result.output.clone());
                    None
                }
                StepStatus::Cancelled => {
                    step.error = result.error;
                    None
                }
                _ => {
                    let detail = result.error.unwrap_or_else(|| {
                        ErrorDetail::new(ErrorKind::Internal, "stage failed without detail")
                    });
                    step.error = Some(detail.clone());
                    Some(detail)
                }
            };

            run.total_cost += result.cost;
            let event = match (status, failure) {
                (StepStatus::Completed, _) => {
                    run.results.insert(stage_id.to_string(), result.output);
                    Some(RunEvent::StageCompleted {
                        run_id,
                        stage_id: stage_id.to_string(),
                        duration_ms,
                    })
                }
                (_, Some(detail)) => {
                    let error = detail.message.clone();
                    run.errors.push(detail);
                    Some(RunEvent::StageFailed {
                        run_id,
                        stage_id: stage_id.to_string(),
                        error,
                    })
                }
                _ => None,
            };
            Ok(((), event))
        })
        .await
    }

    /// Mark a stage skipped because its condition evaluated false.
    pub async fn record_stage_skipped(
        &self,
        run_id: &RunId,
        stage_id: &str,
        reason: &str,
    ) -> Result<()> {
        let reason = reason.to_string();
        self.mutate(run_id, Persist::Step(stage_id.to_string()), |run| {
            let step = open_step(run, stage_id, StepStatus::Skipped)?;
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            step.log.push(reason);
            let event = RunEvent::StageSkipped {
                run_id: run.id.clone(),
                stage_id: stage_id.to_string(),
            };
            Ok(((), Some(event)))
        })
        .await
    }

    /// Finish a run with a terminal status and its final variables. Once the
    /// sink holds the final snapshot the in-memory record is dropped and
    /// later reads go to the sink.
    pub async fn complete(
        &self,
        run_id: &RunId,
        status: RunStatus,
        variables: Map<String, Value>,
    ) -> Result<RunExecution> {
        let (run, persisted) = self.apply(run_id, Persist::Run, |run| {
            if !status.is_terminal() || !run.status.can_transition_to(status) {
                return Err(invalid_transition(run, run.status.as_str(), status.as_str()));
            }
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.variables = variables;
            if status == RunStatus::Cancelled {
                for step in run.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
                    step.status = StepStatus::Cancelled;
                }
            }
            let event = RunEvent::RunFinished {
                run_id: run.id.clone(),
                status,
                duration_ms: run.duration_ms().unwrap_or(0),
                total_cost: run.total_cost,
            };
            Ok((run.clone(), Some(event)))
        })
        .await?;
        if persisted {
            self.runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(run_id);
            debug!(run_id = %run_id, status = %status, "Run finished, record released");
        }
        Ok(run)
    }

    /// Current state of a run, falling back to the sink for runs not held
    /// in memory.
    pub async fn snapshot(&self, run_id: &RunId) -> Result<Option<RunExecution>> {
        match self.record(run_id) {
            Ok(record) => Ok(Some(record.lock().await.clone())),
            Err(_) => self.sink.load_run(run_id).await,
        }
    }

    pub async fn progress(&self, run_id: &RunId) -> Result<Option<RunProgress>> {
        Ok(self.snapshot(run_id).await?.map(|run| run.progress()))
    }

    /// Run summaries of a definition, newest first.
    pub async fn history(
        &self,
        definition_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RunSummary>> {
        self.sink.list_runs(definition_id, offset, limit).await
    }

    /// Runs that are running or paused.
    pub async fn active_runs(&self) -> Vec<RunSummary> {
        let records: Vec<RunRecord> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut active = Vec::new();
        for record in records {
            let run = record.lock().await;
            if run.status.is_active() {
                active.push(run.summary());
            }
        }
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }
}

fn invalid_transition(run: &RunExecution, from: &str, to: &str) -> ConductorError {
    ConductorError::InvalidTransition {
        run_id: run.id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Stage record of a run that still accepts changes.
fn open_step<'a>(
    run: &'a mut RunExecution,
    stage_id: &str,
    to: StepStatus,
) -> Result<&'a mut StepExecution> {
    if run.status.is_terminal() {
        return Err(invalid_transition(run, run.status.as_str(), to.as_str()));
    }
    let run_id = run.id.to_string();
    let step = run
        .step_mut(stage_id)
        .ok_or_else(|| ConductorError::StageNotFound {
            run_id: run_id.clone(),
            stage: stage_id.to_string(),
        })?;
    if step.status.is_terminal() {
        return Err(ConductorError::InvalidTransition {
            run_id,
            from: format!("{stage_id}:{}", step.status),
            to: format!("{stage_id}:{to}"),
        });
    }
    Ok(step)
}
