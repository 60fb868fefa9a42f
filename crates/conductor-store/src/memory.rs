use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::PersistenceSink;
use conductor_core::types::{RunExecution, RunId, RunSummary, StepExecution};

/// Process-local run store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, RunExecution>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_err(e: impl std::fmt::Display) -> ConductorError {
    ConductorError::Database(e.to_string())
}

impl PersistenceSink for MemoryRunStore {
    fn save_run(&self, run: &RunExecution) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.runs.lock().map_err(lock_err)?.insert(run.id.clone(), run);
            Ok(())
        })
    }

    fn save_step(&self, run_id: &RunId, step: &StepExecution) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let step = step.clone();
        Box::pin(async move {
            let mut runs = self.runs.lock().map_err(lock_err)?;
            let run = runs
                .get_mut(&run_id)
                .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))?;
            match run.step_mut(&step.stage_id) {
                Some(existing) => *existing = step,
                None => run.steps.push(step),
            }
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunExecution>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.runs.lock().map_err(lock_err)?.get(&run_id).cloned()) })
    }

    fn list_runs(
        &self,
        definition_id: &str,
        offset: usize,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let definition_id = definition_id.to_string();
        Box::pin(async move {
            let runs = self.runs.lock().map_err(lock_err)?;
            let mut summaries: Vec<RunSummary> = runs
                .values()
                .filter(|r| r.definition_id == definition_id)
                .map(|r| r.summary())
                .collect();
            summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            Ok(summaries.into_iter().skip(offset).take(limit).collect())
        })
    }
}
