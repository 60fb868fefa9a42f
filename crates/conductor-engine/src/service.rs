use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conductor_core::definition::WorkflowDefinition;
use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{RunEvent, RunExecution, RunId, RunProgress, RunStatus, RunSummary};

use crate::context::ExecutionContext;
use crate::controller::StageController;
use crate::engine::Engine;

/// Asynchronous front door: starts runs in the background and answers
/// status, control, and history queries.
pub struct WorkflowService {
    engine: Arc<Engine>,
    runs: Arc<Mutex<HashMap<RunId, Arc<ExecutionContext>>>>,
}

impl WorkflowService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        self.engine.register_definition(definition)
    }

    pub fn load_definitions(&self, dir: &Path) -> Result<usize> {
        self.engine.load_definitions(dir)
    }

    /// Begin a run and drive it on a background task. Returns once the run
    /// record exists.
    pub async fn start_run(
        &self,
        definition_id: &str,
        variables: Map<String, Value>,
        initiated_by: &str,
    ) -> Result<RunId> {
        let definition = self.engine.definition(definition_id)?;
        definition.validate()?;

        let run = self
            .engine
            .tracker()
            .begin(&definition, initiated_by, variables.clone(), None)
            .await?;
        let run_id = run.id;
        let ctx = Arc::new(ExecutionContext::new(
            run_id.clone(),
            variables,
            CancellationToken::new(),
        ));
        self.lock_runs().insert(run_id.clone(), ctx.clone());
        info!(run_id = %run_id, definition = definition_id, initiated_by, "Run submitted");

        let engine = self.engine.clone();
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let controller = StageController::new(engine.clone());
            if let Err(e) = controller.execute_run(&definition, &ctx).await {
                error!(run_id = %ctx.run_id(), error = %e, "Run aborted");
                let status = if ctx.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                if let Err(e) = engine
                    .tracker()
                    .complete(ctx.run_id(), status, ctx.variables())
                    .await
                {
                    warn!(run_id = %ctx.run_id(), error = %e, "Could not finalize aborted run");
                }
            }
            runs.lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(ctx.run_id());
        });

        Ok(run_id)
    }

    /// Wait until a run reaches a terminal status and return its record.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunExecution> {
        let mut rx = self.engine.event_bus().subscribe();
        loop {
            let run = self.get_status(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            loop {
                match rx.recv().await {
                    Ok(RunEvent::RunFinished { run_id: id, .. }) if &id == run_id => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ConductorError::RunNotFound(run_id.to_string()))
                    }
                }
            }
        }
    }

    /// Current record of a run, live or persisted.
    pub async fn get_status(&self, run_id: &RunId) -> Result<RunExecution> {
        self.engine
            .tracker()
            .snapshot(run_id)
            .await?
            .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))
    }

    pub async fn progress(&self, run_id: &RunId) -> Result<RunProgress> {
        self.engine
            .tracker()
            .progress(run_id)
            .await?
            .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))
    }

    /// Request cancellation. False when the run is unknown or already done.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.context(run_id) {
            Some(ctx) if !ctx.is_cancelled() => {
                ctx.cancel();
                info!(run_id = %run_id, "Run cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Pause at the next phase boundary.
    pub fn pause(&self, run_id: &RunId) -> bool {
        match self.context(run_id) {
            Some(ctx) if !ctx.is_paused() && !ctx.is_cancelled() => {
                ctx.pause();
                info!(run_id = %run_id, "Run pause requested");
                true
            }
            _ => false,
        }
    }

    pub fn resume(&self, run_id: &RunId) -> bool {
        match self.context(run_id) {
            Some(ctx) if ctx.is_paused() => {
                ctx.resume();
                info!(run_id = %run_id, "Run resume requested");
                true
            }
            _ => false,
        }
    }

    /// One page (1-based) of a definition's run history, newest first.
    pub async fn get_history(
        &self,
        definition_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RunSummary>> {
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        self.engine
            .tracker()
            .history(definition_id, offset, page_size)
            .await
    }

    pub async fn active_runs(&self) -> Vec<RunSummary> {
        self.engine.tracker().active_runs().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.engine.event_bus().subscribe()
    }

    fn context(&self, run_id: &RunId) -> Option<Arc<ExecutionContext>> {
        self.lock_runs().get(run_id).cloned()
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Arc<ExecutionContext>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
