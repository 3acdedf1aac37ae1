//! End-to-end workflow tests.
//!
//! These drive whole graphs through `WorkflowManager` with in-memory state
//! and check ordering, failure propagation, the final status report and
//! the event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cadence::decompose::{TaskDecomposer, TemplateCatalog, WorkflowRequest};
use cadence::{
    Error, EventKind, ExecutorRegistry, RunPolicy, Task, TaskGraph, TaskId, TaskResult,
    TaskStatus, WorkflowStatus,
};

use crate::fixtures::*;

/// Test: Diamond ordering
/// Given A -> {B, C} -> D with room for four tasks
/// When the workflow runs
/// Then A runs first, B and C overlap, and D runs last
#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(20));
    let manager = manager_with(registry, RunPolicy::default().with_max_parallel(4));

    let state = manager.execute_graph(diamond("work")).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.progress_percent, 100.0);

    let started = recorder.started();
    assert_eq!(started.len(), 4);
    assert_eq!(started[0], "a");
    assert_eq!(started[3], "d");

    let finished = recorder.finished();
    let d_pos = finished.iter().position(|t| t == "d").unwrap();
    assert!(finished.iter().position(|t| t == "b").unwrap() < d_pos);
    assert!(finished.iter().position(|t| t == "c").unwrap() < d_pos);
    assert_eq!(recorder.peak(), 2, "B and C should run concurrently");

    let report = state.report();
    assert_eq!(report.completed_task_ids.len(), 4);
    assert!(report.failed_tasks.is_empty());
    assert!(report.skipped_task_ids.is_empty());
}

/// Test: Dependency outputs
/// Given tasks that read their dependencies' outputs from the context
/// When the workflow runs
/// Then every task sees the outputs it depends on
#[tokio::test]
async fn test_outputs_flow_to_dependents() {
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("num", |task: Task, _ctx| async move {
        TaskResult::success(task.input["value"].clone())
    });
    registry.register_fn("sum", |task: Task, ctx: cadence::TaskContext| async move {
        let mut total = 0;
        for dep in &task.dependencies {
            match ctx.dependency_output(dep).await {
                Ok(Some(v)) => total += v.as_i64().unwrap_or(0),
                Ok(None) => return TaskResult::failure(format!("missing output of {}", dep)),
                Err(e) => return TaskResult::failure(e.to_string()),
            }
        }
        TaskResult::success(json!(total))
    });

    let graph = TaskGraph::from_tasks(vec![
        Task::new("x", "num").with_input(json!({ "value": 2 })),
        Task::new("y", "num").with_input(json!({ "value": 40 })),
        Task::new("total", "sum").with_dependencies(["x", "y"]),
    ])
    .unwrap();

    let manager = manager_with(registry, RunPolicy::default());
    let state = manager.execute_graph(graph).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let total = state.graph.get_task(&TaskId::new("total")).unwrap();
    assert_eq!(total.output, Some(json!(42)));
    assert_eq!(state.context.get("total"), Some(&json!(42)));
}

/// Test: Critical failure
/// Given a diamond where B always fails and retries are disabled
/// When the workflow runs
/// Then the workflow fails, B is reported failed and D never runs
#[tokio::test]
async fn test_critical_failure_skips_descendants() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(
        &mut registry,
        "work",
        HashMap::from([("b".to_string(), usize::MAX)]),
    );
    let manager = manager_with(registry, fast_policy().with_max_retries(0));

    let state = manager.execute_graph(diamond("work")).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    let report = state.report();
    assert_eq!(report.failed_task_ids(), vec![TaskId::new("b")]);
    assert!(report.skipped_task_ids.contains(&TaskId::new("d")));
    assert_eq!(recorder.attempts("b"), 1);
    assert_eq!(recorder.attempts("d"), 0);
    assert!(!state.errors.is_empty());

    let d = state.graph.get_task(&TaskId::new("d")).unwrap();
    assert_eq!(d.status, TaskStatus::Skipped);
}

/// Test: Non-critical failure
/// Given a leaf task marked non-critical that always fails
/// When the workflow runs
/// Then the workflow still completes and lists the failure
#[tokio::test]
async fn test_non_critical_failure_completes_workflow() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(
        &mut registry,
        "work",
        HashMap::from([("notify".to_string(), usize::MAX)]),
    );
    let graph = TaskGraph::from_tasks(vec![
        Task::new("build", "work"),
        Task::new("notify", "work")
            .with_dependencies(["build"])
            .with_critical(false),
    ])
    .unwrap();
    let manager = manager_with(registry, fast_policy().with_max_retries(1));

    let state = manager.execute_graph(graph).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let report = state.report();
    assert_eq!(report.completed_task_ids, vec![TaskId::new("build")]);
    assert_eq!(report.failed_tasks.len(), 1);
    assert_eq!(report.failed_tasks[0].task_id, TaskId::new("notify"));
    assert_eq!(report.failed_tasks[0].retry_count, 2);
    assert_eq!(recorder.attempts("notify"), 2);
}

/// Test: Cycle rejection
/// Given a catalog where A depends on B and B depends on A
/// When the graph is built
/// Then decomposition fails with the cycle path and no workflow exists
#[tokio::test]
async fn test_cyclic_catalog_creates_no_state() {
    let catalog = TemplateCatalog::from_toml_str(
        r#"
        [[template]]
        name = "a"
        kind = "echo"
        depends_on = ["b"]

        [[template]]
        name = "b"
        kind = "echo"
        depends_on = ["a"]
        "#,
    )
    .unwrap();
    let registry = Arc::new(ExecutorRegistry::with_builtins());
    let decomposer = TaskDecomposer::new(catalog, Arc::clone(&registry));
    let manager = cadence::WorkflowManager::new(memory_store(), registry, RunPolicy::default());

    let result = decomposer.build(&WorkflowRequest::new().with_template("a"));
    match result {
        Err(Error::CyclicGraph { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected CyclicGraph, got {:?}", other.map(|g| g.task_count())),
    }
    assert!(manager.list_workflows().await.unwrap().is_empty());
}

/// Test: Catalog to completion
/// Given a catalog that fans a section template out over a param
/// When the request is decomposed and executed with the built-in executors
/// Then every generated task runs and the join task sees all sections
#[tokio::test]
async fn test_decomposed_catalog_runs_to_completion() {
    let catalog = TemplateCatalog::from_toml_str(
        r#"
        [[template]]
        name = "outline"
        kind = "echo"
        [template.params]
        topic = "${topic}"

        [[template]]
        name = "section"
        kind = "echo"
        depends_on = ["outline"]
        fan_out = "sections"
        [template.params]
        heading = "${item}"
        position = "${index}"

        [[template]]
        name = "assemble"
        kind = "echo"
        depends_on = ["section"]
        "#,
    )
    .unwrap();
    let registry = Arc::new(ExecutorRegistry::with_builtins());
    let decomposer = TaskDecomposer::new(catalog, Arc::clone(&registry));
    let request = WorkflowRequest::new()
        .with_template("assemble")
        .with_param("topic", "rust")
        .with_param("sections", json!(["intro", "body", "outro"]));

    let graph = decomposer.build(&request).unwrap();
    assert_eq!(graph.task_count(), 5);

    let manager = cadence::WorkflowManager::new(memory_store(), registry, RunPolicy::default());
    let state = manager.execute_graph(graph).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);

    let outline = state.graph.get_task(&TaskId::new("outline")).unwrap();
    assert_eq!(outline.output.as_ref().unwrap()["input"]["topic"], json!("rust"));

    let assemble = state.graph.get_task(&TaskId::new("assemble")).unwrap();
    let deps = &assemble.output.as_ref().unwrap()["dependencies"];
    assert_eq!(deps["section-1"]["input"]["heading"], json!("body"));
    assert_eq!(deps["section-2"]["input"]["position"], json!(2));
}

/// Test: Event stream
/// Given a subscriber attached before the run starts
/// When the workflow runs
/// Then task events arrive in lifecycle order and the stream ends after
/// the terminal workflow event
#[tokio::test]
async fn test_event_stream_reports_lifecycle() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(
        &mut registry,
        "work",
        HashMap::from([("b".to_string(), 1)]),
    );
    let manager = manager_with(registry, fast_policy());

    let id = manager.prepare(diamond("work")).await.unwrap();
    let stream = manager.subscribe(id).await.unwrap();
    let collector = tokio::spawn(collect_events(stream));

    let state = manager.execute(id, fast_policy()).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);

    let events = collector.await.unwrap();
    assert_eq!(
        kinds_for(&events, "a"),
        vec![EventKind::TaskStarted, EventKind::TaskCompleted]
    );
    assert_eq!(
        kinds_for(&events, "b"),
        vec![
            EventKind::TaskStarted,
            EventKind::TaskRetrying,
            EventKind::TaskStarted,
            EventKind::TaskCompleted,
        ]
    );
    assert!(events.iter().all(|e| e.workflow_id == id));
    assert_eq!(events.last().unwrap().kind, EventKind::WorkflowCompleted);

    let progress: Vec<f64> = events
        .iter()
        .filter(|e| e.kind == EventKind::ProgressUpdated)
        .filter_map(|e| e.payload["progress_percent"].as_f64())
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), 100.0);
}

/// Test: Late subscriber
/// Given a workflow that already finished
/// When a client subscribes
/// Then the stream ends immediately
#[tokio::test]
async fn test_subscribe_after_finish_ends_immediately() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = manager_with(registry, RunPolicy::default());

    let state = manager.execute_graph(diamond("work")).await.unwrap();
    let mut stream = manager.subscribe(state.id).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream should close");
    assert!(next.is_none());
}

/// Test: Status report
/// Given a finished workflow
/// When its status is read back from the store
/// Then it matches the state returned by the run
#[tokio::test]
async fn test_status_report_matches_store() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = manager_with(registry, RunPolicy::default());

    let state = manager.execute_graph(diamond("work")).await.unwrap();
    let report = manager.get_status(state.id).await.unwrap();

    assert_eq!(report.workflow_id, state.id);
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.progress_percent, 100.0);
    assert_eq!(report.completed_task_ids.len(), 4);
    assert!(manager.list_active().is_empty());
    assert_eq!(manager.list_workflows().await.unwrap(), vec![state.id]);

    manager.delete(state.id).await.unwrap();
    assert!(matches!(
        manager.get_status(state.id).await,
        Err(Error::WorkflowNotFound(_))
    ));
}

/// Test: Empty graph
/// Given a workflow with no tasks
/// When it runs
/// Then it completes at once with full progress
#[tokio::test]
async fn test_empty_graph_completes() {
    let manager = manager_with(ExecutorRegistry::new(), RunPolicy::default());
    let state = manager.execute_graph(TaskGraph::new()).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.progress_percent, 100.0);
}
