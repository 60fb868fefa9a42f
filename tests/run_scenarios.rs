use std::sync::Arc;

use serde_json::{json, Map, Value};

use conductor_core::config::EngineConfig;
use conductor_core::definition::{ExecutorKind, InputSource, StepSpec, WorkflowDefinition};
use conductor_core::traits::PersistenceSink;
use conductor_core::types::{RunEvent, RunStatus, StepStatus, Thought};
use conductor_engine::{Engine, WorkflowService};
use conductor_executors::ExecutorRegistry;
use conductor_store::SqliteRunStore;
use conductor_test_utils::{RecordingExecutor, ScriptedExecutor, ScriptedReasoner, SlowExecutor};

fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_retry_then_agent_scenario_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteRunStore::open(&dir.path().join("runs.db")).unwrap());

    let mut registry = ExecutorRegistry::new();
    registry.register(ScriptedExecutor::new("extract").with_output(json!({"rows": 12})));
    let flaky = ScriptedExecutor::new("load").failing(2).with_output(json!({"loaded": 12}));
    let load_calls = flaky.counter();
    registry.register(flaky);
    registry.register(RecordingExecutor::new("lookup"));

    let reasoner = ScriptedReasoner::new(vec![
        Thought::act("Check the row count", "lookup", json!({"rows": 12})),
        Thought::answer("Counts match", "12 rows loaded"),
    ]);
    let engine = Engine::builder(EngineConfig::default())
        .registry(registry)
        .reasoner(Arc::new(reasoner))
        .sink(store.clone())
        .build();
    let service = WorkflowService::new(engine);
    service
        .register_definition(
            WorkflowDefinition::new("etl", "Nightly ETL")
                .with_stage(StepSpec::tool("a", 1, "extract").with_output("rows", "rows"))
                .with_stage(
                    StepSpec::tool("b", 2, "load").with_input("count", InputSource::variable("rows")),
                )
                .with_stage(StepSpec::agent_stage("c", 3, "Verify {{vars.rows}} rows were loaded")),
        )
        .unwrap();

    let run_id = service.start_run("etl", Map::new(), "scheduler").await.unwrap();
    let run = service.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let b = run.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Completed);
    assert_eq!(b.retry_count, 2);
    assert_eq!(load_calls.get(), 3);
    assert_eq!(b.input, Some(json!({"count": 12})));
    assert_eq!(run.results["c"]["answer"], json!("12 rows loaded"));
    assert_eq!(run.results["c"]["objective"], json!("Verify 12 rows were loaded"));
    assert_eq!(run.results["c"]["actions"], json!(1));

    let persisted = store.load_run(&run_id).await.unwrap().expect("persisted run");
    assert_eq!(persisted.status, RunStatus::Completed);
    assert_eq!(persisted.step("b").unwrap().retry_count, 2);
    assert_eq!(persisted.step("b").unwrap().attempts.len(), 3);
    assert_eq!(persisted.initiated_by, "scheduler");
}

#[tokio::test]
async fn test_condition_stage_gates_later_stage() {
    let mut registry = ExecutorRegistry::new();
    let notify = RecordingExecutor::new("notify");
    let calls = notify.calls();
    registry.register(notify);
    let engine = Engine::builder(EngineConfig::default()).registry(registry).build();
    let service = WorkflowService::new(engine);
    service
        .register_definition(
            WorkflowDefinition::new("alert", "Alert")
                .with_stage(
                    StepSpec::new("check", ExecutorKind::Condition, 1)
                        .with_expression("errors > threshold"),
                )
                .with_stage(
                    StepSpec::tool("notify", 2, "notify")
                        .with_condition("steps.check.result == true")
                        .with_param("channel", json!("ops")),
                ),
        )
        .unwrap();

    let quiet = service
        .start_run("alert", vars(&[("errors", json!(1)), ("threshold", json!(5))]), "test")
        .await
        .unwrap();
    let run = service.wait(&quiet).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.results["check"], json!({"result": false}));
    assert_eq!(run.step("notify").unwrap().status, StepStatus::Skipped);
    assert!(calls.lock().unwrap().is_empty());

    let noisy = service
        .start_run("alert", vars(&[("errors", json!(9)), ("threshold", json!(5))]), "test")
        .await
        .unwrap();
    let run = service.wait(&noisy).await.unwrap();
    assert_eq!(run.step("notify").unwrap().status, StepStatus::Completed);
    assert_eq!(calls.lock().unwrap().as_slice(), &[json!({"channel": "ops"})]);
}

#[tokio::test]
async fn test_parallel_results_independent_of_completion_order() {
    let definition = WorkflowDefinition::new("fan", "Fan out")
        .with_stage(StepSpec::tool("seed", 1, "seed").with_output("base", "value"))
        .with_stage(
            StepSpec::tool("left", 2, "left")
                .in_group("fan")
                .with_input("base", InputSource::variable("base"))
                .with_output("left", "base"),
        )
        .with_stage(
            StepSpec::tool("right", 3, "right")
                .in_group("fan")
                .with_input("base", InputSource::variable("base"))
                .with_output("right", "base"),
        )
        .with_stage(
            StepSpec::tool("join", 4, "join")
                .with_input("l", InputSource::step("left", "base"))
                .with_input("r", InputSource::step("right", "base")),
        );

    let mut outcomes = Vec::new();
    let mut orders = Vec::new();
    for (left_ms, right_ms, workers) in [(80, 5, 8), (5, 80, 8), (80, 5, 1)] {
        let mut config = EngineConfig::default();
        config.engine.max_parallel_stages = workers;
        let mut registry = ExecutorRegistry::new();
        registry.register(ScriptedExecutor::new("seed").with_output(json!({"value": 7})));
        registry.register(SlowExecutor::new("left", left_ms));
        registry.register(SlowExecutor::new("right", right_ms));
        registry.register(RecordingExecutor::new("join"));
        let service = WorkflowService::new(Engine::builder(config).registry(registry).build());
        service.register_definition(definition.clone()).unwrap();

        let mut events = service.subscribe();
        let run_id = service.start_run("fan", Map::new(), "test").await.unwrap();
        let run = service.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let mut order = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::StageCompleted { run_id: id, stage_id, .. } = event {
                if id == run_id && (stage_id == "left" || stage_id == "right") {
                    order.push(stage_id);
                }
            }
        }
        orders.push(order);
        outcomes.push((run.results, run.variables));
    }

    assert_eq!(orders[0], vec!["right", "left"]);
    assert_eq!(orders[1], vec!["left", "right"]);
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0], outcomes[2]);
    assert_eq!(outcomes[0].0["join"], json!({"l": 7, "r": 7}));
    assert_eq!(outcomes[0].1["left"], json!(7));
    assert_eq!(outcomes[0].1["right"], json!(7));
}

#[tokio::test]
async fn test_pause_and_resume_between_phases() {
    let mut registry = ExecutorRegistry::new();
    registry.register(SlowExecutor::new("first", 50));
    let second = RecordingExecutor::new("second");
    let second_calls = second.calls();
    registry.register(second);
    let service = WorkflowService::new(
        Engine::builder(EngineConfig::default()).registry(registry).build(),
    );
    service
        .register_definition(
            WorkflowDefinition::new("two", "Two phases")
                .with_stage(StepSpec::tool("first", 1, "first"))
                .with_stage(StepSpec::tool("second", 2, "second")),
        )
        .unwrap();

    let mut events = service.subscribe();
    let run_id = service.start_run("two", Map::new(), "test").await.unwrap();
    assert!(service.pause(&run_id));
    assert!(!service.pause(&run_id));

    loop {
        match events.recv().await.unwrap() {
            RunEvent::RunPaused { run_id: id } if id == run_id => break,
            _ => {}
        }
    }
    assert_eq!(service.get_status(&run_id).await.unwrap().status, RunStatus::Paused);
    assert_eq!(service.active_runs().await.len(), 1);
    assert!(second_calls.lock().unwrap().is_empty());

    assert!(service.resume(&run_id));
    let run = service.wait(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(second_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_while_paused() {
    let mut registry = ExecutorRegistry::new();
    registry.register(RecordingExecutor::new("only"));
    let service = WorkflowService::new(
        Engine::builder(EngineConfig::default()).registry(registry).build(),
    );
    service
        .register_definition(
            WorkflowDefinition::new("one", "One").with_stage(StepSpec::tool("only", 1, "only")),
        )
        .unwrap();

    let mut events = service.subscribe();
    let run_id = service.start_run("one", Map::new(), "test").await.unwrap();
    service.pause(&run_id);
    loop {
        if let RunEvent::RunPaused { .. } = events.recv().await.unwrap() {
            break;
        }
    }

    assert!(service.cancel(&run_id));
    let run = service.wait(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.step("only").unwrap().status, StepStatus::Cancelled);
    assert!(!run.has_errors());
}

#[tokio::test]
async fn test_history_pages_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteRunStore::open(&dir.path().join("runs.db")).unwrap());
    let mut registry = ExecutorRegistry::new();
    registry.register(RecordingExecutor::new("noop"));
    let service = WorkflowService::new(
        Engine::builder(EngineConfig::default())
            .registry(registry)
            .sink(store)
            .build(),
    );
    service
        .register_definition(
            WorkflowDefinition::new("tiny", "Tiny").with_stage(StepSpec::tool("noop", 1, "noop")),
        )
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let run_id = service
            .start_run("tiny", Map::new(), &format!("caller-{i}"))
            .await
            .unwrap();
        service.wait(&run_id).await.unwrap();
        ids.push(run_id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let first = service.get_history("tiny", 1, 2).await.unwrap();
    let second = service.get_history("tiny", 2, 2).await.unwrap();
    let third = service.get_history("tiny", 3, 2).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(third.is_empty());
    assert_eq!(first[0].run_id, ids[2]);
    assert_eq!(first[1].run_id, ids[1]);
    assert_eq!(second[0].run_id, ids[0]);
    assert_eq!(second[0].initiated_by, "caller-0");
    assert!(first.iter().all(|r| r.status == RunStatus::Completed));
    assert!(service.get_history("other", 1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_between_phases_preserves_finished_stage() {
    let mut registry = ExecutorRegistry::new();
    registry.register(SlowExecutor::new("first", 50));
    let second = RecordingExecutor::new("second");
    let second_calls = second.calls();
    registry.register(second);
    let service = WorkflowService::new(
        Engine::builder(EngineConfig::default()).registry(registry).build(),
    );
    service
        .register_definition(
            WorkflowDefinition::new("two", "Two phases")
                .with_stage(StepSpec::tool("first", 1, "first").with_param("n", json!(1)))
                .with_stage(StepSpec::tool("second", 2, "second")),
        )
        .unwrap();

    let mut events = service.subscribe();
    let run_id = service.start_run("two", Map::new(), "test").await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            RunEvent::StageStarted { run_id: id, stage_id, .. } if id == run_id && stage_id == "first" => {
                break
            }
            _ => {}
        }
    }
    // Requested mid-phase, the pause lands on the boundary after "first".
    assert!(service.pause(&run_id));
    loop {
        if let RunEvent::RunPaused { run_id: id } = events.recv().await.unwrap() {
            if id == run_id {
                break;
            }
        }
    }
    let at_boundary = service.get_status(&run_id).await.unwrap();
    let first = at_boundary.step("first").unwrap().clone();
    assert_eq!(first.status, StepStatus::Completed);
    assert_eq!(first.output, Some(json!({"n": 1})));

    assert!(service.cancel(&run_id));
    let run = service.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(second_calls.lock().unwrap().is_empty());
    assert_eq!(run.step("second").unwrap().status, StepStatus::Cancelled);
    assert_eq!(run.step("first").unwrap(), &first);
    assert_eq!(run.results["first"], json!({"n": 1}));
    assert!(!run.has_errors());
}
