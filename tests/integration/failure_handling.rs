//! Retry, timeout, panic and infrastructure failure tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence::core::TaskErrorKind;
use cadence::{
    ExecutorRegistry, RunPolicy, StateStore, Task, TaskGraph, TaskId, TaskResult, TaskStatus,
    WorkflowManager, WorkflowStatus,
};

use crate::fixtures::*;

fn single(kind: &str) -> TaskGraph {
    graph_of(kind, &[("only", &[])])
}

/// Test: Transient failures
/// Given a task that fails twice before succeeding and three retries
/// When the workflow runs
/// Then it completes after three attempts
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(&mut registry, "work", HashMap::from([("only".to_string(), 2)]));
    let manager = manager_with(registry, fast_policy().with_max_retries(3));

    let state = manager.execute_graph(single("work")).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(recorder.attempts("only"), 3);
    let task = state.graph.get_task(&TaskId::new("only")).unwrap();
    assert_eq!(task.retry_count, 2);
    assert!(task.error.is_none());
}

/// Test: Retry budget
/// Given a task that always fails and max_retries = 2
/// When the workflow runs
/// Then the task is attempted exactly three times and the workflow fails
#[tokio::test]
async fn test_retries_stop_at_budget() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(
        &mut registry,
        "work",
        HashMap::from([("only".to_string(), usize::MAX)]),
    );
    let manager = manager_with(registry, fast_policy().with_max_retries(2));

    let state = manager.execute_graph(single("work")).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(recorder.attempts("only"), 3);
    let report = state.report();
    assert_eq!(report.failed_tasks[0].retry_count, 3);
    assert!(report.failed_tasks[0].message.contains("attempt 3 failed"));
}

/// Test: Per-task retry override
/// Given a task whose own budget is zero under a policy allowing three
/// When it fails
/// Then it is not retried
#[tokio::test]
async fn test_task_retry_limit_overrides_policy() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(
        &mut registry,
        "work",
        HashMap::from([("once".to_string(), usize::MAX)]),
    );
    let graph = TaskGraph::from_tasks(vec![Task::new("once", "work").with_max_retries(0)]).unwrap();
    let manager = manager_with(registry, fast_policy().with_max_retries(3));

    let state = manager.execute_graph(graph).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(recorder.attempts("once"), 1);
}

/// Test: Exponential backoff
/// Given a task that fails twice with a 40ms backoff base
/// When the workflow runs
/// Then the run waits at least 40ms + 80ms between attempts
#[tokio::test]
async fn test_backoff_delays_retries() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register_flaky(&mut registry, "work", HashMap::from([("only".to_string(), 2)]));
    let policy = RunPolicy::default()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(40), Duration::from_secs(1));
    let manager = manager_with(registry, policy);

    let start = Instant::now();
    let state = manager.execute_graph(single("work")).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(start.elapsed() >= Duration::from_millis(120));
}

/// Test: Timeouts
/// Given a task slower than the task timeout and one retry
/// When the workflow runs
/// Then both attempts time out and the task fails with a timeout error
#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("slow", |_task, _ctx| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        TaskResult::success(serde_json::Value::Null)
    });
    let policy = fast_policy()
        .with_max_retries(1)
        .with_task_timeout(Duration::from_millis(50));
    let manager = manager_with(registry, policy);

    let start = Instant::now();
    let state = manager.execute_graph(single("slow")).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(state.status, WorkflowStatus::Failed);
    let task = state.graph.get_task(&TaskId::new("only")).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::Timeout);
}

/// Test: Panicking executor
/// Given a non-critical task whose executor panics next to a healthy task
/// When the workflow runs
/// Then the panic is recorded as a failure and the run still completes
#[tokio::test]
async fn test_executor_panic_is_contained() {
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("explode", |task: Task, _ctx| async move {
        if task.input["explode"] == true {
            panic!("boom");
        }
        TaskResult::success(serde_json::Value::Null)
    });
    registry.register_fn("fine", |_task, _ctx| async {
        TaskResult::success(serde_json::json!("ok"))
    });
    let graph = TaskGraph::from_tasks(vec![
        Task::new("bad", "explode")
            .with_input(serde_json::json!({ "explode": true }))
            .with_critical(false),
        Task::new("good", "fine"),
    ])
    .unwrap();
    let manager = manager_with(registry, fast_policy().with_max_retries(0));

    let state = manager.execute_graph(graph).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let report = state.report();
    assert_eq!(report.completed_task_ids, vec![TaskId::new("good")]);
    assert_eq!(report.failed_tasks.len(), 1);
    assert!(report.failed_tasks[0].message.contains("executor panicked: boom"));
}

/// Test: Store outage before start
/// Given a backend that rejects writes once the workflow is prepared
/// When the workflow is executed
/// Then execute returns the infrastructure error and the run is released
#[tokio::test]
async fn test_store_outage_aborts_run() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    // One workflow record plus one task record.
    let store = StateStore::new(Arc::new(FailingBackend::new(2)));
    let manager = WorkflowManager::new(store, Arc::new(registry), RunPolicy::default());

    let id = manager.prepare(single("work")).await.unwrap();
    let err = manager.execute(id, RunPolicy::default()).await.unwrap_err();

    assert!(err.is_infrastructure());
    assert!(recorder.started().is_empty());
    assert!(manager.list_active().is_empty());
    assert_eq!(
        manager.get_status(id).await.unwrap().status,
        WorkflowStatus::Pending
    );
}

/// Test: Store outage mid-run
/// Given a backend that fails when the first output is written
/// When the workflow runs
/// Then the error surfaces from execute and the last snapshot survives
#[tokio::test]
async fn test_store_outage_mid_run_propagates() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    // prepare (2) + running snapshot (2) + task dispatch record (1)
    let store = StateStore::new(Arc::new(FailingBackend::new(5)));
    let manager = WorkflowManager::new(store, Arc::new(registry), RunPolicy::default());

    let id = manager.prepare(single("work")).await.unwrap();
    let stream = manager.subscribe(id).await.unwrap();
    let collector = tokio::spawn(collect_events(stream));
    let err = manager.execute(id, RunPolicy::default()).await.unwrap_err();

    assert!(err.is_infrastructure());
    assert_eq!(recorder.started(), vec!["only"]);
    assert_eq!(
        manager.get_status(id).await.unwrap().status,
        WorkflowStatus::Running
    );
    // Subscribers are released when a run aborts.
    let events = collector.await.unwrap();
    assert!(events.iter().all(|e| !e.is_terminal()));
}
