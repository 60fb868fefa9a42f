use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use conductor_core::types::RunId;

/// Per-run state shared by every stage of the run.
///
/// Stage outputs are append-only. Concurrent stages only write disjoint
/// variable keys, which definition validation guarantees.
pub struct ExecutionContext {
    run_id: RunId,
    depth: usize,
    working_dir: PathBuf,
    variables: RwLock<Map<String, Value>>,
    step_outputs: RwLock<BTreeMap<String, Value>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, variables: Map<String, Value>, cancel: CancellationToken) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            run_id,
            depth: 0,
            working_dir: std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
            variables: RwLock::new(variables),
            step_outputs: RwLock::new(BTreeMap::new()),
            logs: Mutex::new(HashMap::new()),
            cancel,
            paused: Arc::new(paused),
            deadline: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    /// Context for a nested run, one level deeper. `cancel` should be a
    /// child of this context's token. The pause signal is shared, so pausing
    /// the parent also pauses the child at its next phase boundary.
    pub fn child(
        &self,
        run_id: RunId,
        variables: Map<String, Value>,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        let mut child = Self::new(run_id, variables, cancel);
        child.depth = self.depth + 1;
        child.working_dir = self.working_dir.clone();
        child.paused = self.paused.clone();
        child.deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        child
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    /// Point in time by which the whole run must stop, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Bound a stage timeout by the run deadline. `None` once the deadline
    /// has passed.
    pub fn clamp_timeout(&self, timeout: Duration) -> Option<Duration> {
        let Some(deadline) = self.deadline else {
            return Some(timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            None
        } else {
            Some(timeout.min(remaining))
        }
    }

    // Variables

    pub fn variable(&self, name: &str) -> Option<Value> {
        let vars = self.variables.read().unwrap_or_else(|e| e.into_inner());
        vars.get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        let mut vars = self.variables.write().unwrap_or_else(|e| e.into_inner());
        vars.insert(name.into(), value);
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.variables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // Stage outputs

    pub fn step_output(&self, stage_id: &str) -> Option<Value> {
        let outputs = self.step_outputs.read().unwrap_or_else(|e| e.into_inner());
        outputs.get(stage_id).cloned()
    }

    /// Record a stage's output. The first write wins.
    pub fn record_output(&self, stage_id: &str, output: Value) {
        let mut outputs = self.step_outputs.write().unwrap_or_else(|e| e.into_inner());
        outputs.entry(stage_id.to_string()).or_insert(output);
    }

    /// Expression scope: run variables at the top level, plus `vars` and
    /// `steps` objects.
    pub fn scope(&self) -> Value {
        let vars = self.variables();
        let steps: Map<String, Value> = self
            .step_outputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut scope = vars.clone();
        scope.insert("vars".into(), Value::Object(vars));
        scope.insert("steps".into(), Value::Object(steps));
        Value::Object(scope)
    }

    // Stage logs

    pub fn log(&self, stage_id: &str, line: impl Into<String>) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(stage_id.to_string()).or_default().push(line.into());
    }

    /// Drain the log lines collected for a stage.
    pub fn take_logs(&self, stage_id: &str) -> Vec<String> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.remove(stage_id).unwrap_or_default()
    }

    // Cancellation

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // Pause

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until resumed. Returns false if the run was cancelled instead.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        let mut vars = Map::new();
        vars.insert("region".into(), json!("eu"));
        ExecutionContext::new(RunId::from_str("r1"), vars, CancellationToken::new())
    }

    #[test]
    fn test_scope_exposes_variables_and_steps() {
        let ctx = ctx();
        ctx.record_output("fetch", json!({"count": 3}));
        let scope = ctx.scope();
        assert_eq!(scope["region"], json!("eu"));
        assert_eq!(scope["vars"]["region"], json!("eu"));
        assert_eq!(scope["steps"]["fetch"]["count"], json!(3));
    }

    #[test]
    fn test_outputs_are_append_only() {
        let ctx = ctx();
        ctx.record_output("a", json!(1));
        ctx.record_output("a", json!(2));
        assert_eq!(ctx.step_output("a"), Some(json!(1)));
    }

    #[test]
    fn test_logs_drain_per_stage() {
        let ctx = ctx();
        ctx.log("a", "one");
        ctx.log("a", "two");
        ctx.log("b", "other");
        assert_eq!(ctx.take_logs("a"), vec!["one", "two"]);
        assert!(ctx.take_logs("a").is_empty());
        assert_eq!(ctx.take_logs("b"), vec!["other"]);
    }

    #[test]
    fn test_child_shares_cancellation() {
        let parent = ctx();
        let child = parent.child(
            RunId::from_str("r2"),
            Map::new(),
            parent.cancel_token().child_token(),
            None,
        );
        assert_eq!(child.depth(), 1);
        assert!(child.deadline().is_none());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_shares_pause_signal() {
        let parent = ctx();
        let child = parent.child(RunId::from_str("r2"), Map::new(), CancellationToken::new(), None);
        parent.pause();
        assert!(child.is_paused());
        parent.resume();
        assert!(!child.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_clamps_timeouts() {
        let parent = ctx();
        assert_eq!(parent.clamp_timeout(Duration::from_secs(30)), Some(Duration::from_secs(30)));

        let deadline = Instant::now() + Duration::from_secs(2);
        let child = parent.child(RunId::from_str("r2"), Map::new(), CancellationToken::new(), Some(deadline));
        assert_eq!(child.clamp_timeout(Duration::from_secs(30)), Some(Duration::from_secs(2)));
        assert_eq!(child.clamp_timeout(Duration::from_secs(1)), Some(Duration::from_secs(1)));

        // A grandchild keeps the tighter of the two deadlines.
        let later = Instant::now() + Duration::from_secs(10);
        let grandchild = child.child(RunId::from_str("r3"), Map::new(), CancellationToken::new(), Some(later));
        assert_eq!(grandchild.deadline(), Some(deadline));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(child.clamp_timeout(Duration::from_secs(30)), None);
    }

    #[tokio::test]
    async fn test_wait_while_paused_resumes() {
        let ctx = Arc::new(ctx());
        ctx.pause();
        assert!(ctx.is_paused());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_while_paused().await })
        };
        tokio::task::yield_now().await;
        ctx.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_while_paused_cancelled() {
        let ctx = Arc::new(ctx());
        ctx.pause();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_while_paused().await })
        };
        tokio::task::yield_now().await;
        ctx.cancel();
        assert!(!waiter.await.unwrap());
    }
}
