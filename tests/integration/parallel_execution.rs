//! Parallel execution correctness.
//!
//! These tests verify the concurrency bound, priority ordering and dispatch
//! throttling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence::state::{MemoryBackend, RateLimit, RateLimiter};
use cadence::{ExecutorRegistry, RunPolicy, StateStore, Task, TaskGraph, WorkflowManager, WorkflowStatus};

use crate::fixtures::*;

fn independent(kind: &str, count: usize) -> TaskGraph {
    let tasks = (0..count)
        .map(|i| Task::new(format!("t{}", i), kind))
        .collect();
    TaskGraph::from_tasks(tasks).unwrap()
}

/// Test: Concurrency bound
/// Given ten independent tasks and max_parallel = 3
/// When the workflow runs
/// Then no more than three executors ever overlap, and three do
#[tokio::test]
async fn test_max_parallel_is_never_exceeded() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(15));
    let manager = manager_with(registry, RunPolicy::default().with_max_parallel(3));

    let state = manager.execute_graph(independent("work", 10)).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(recorder.started().len(), 10);
    assert_eq!(recorder.peak(), 3);
}

/// Test: Sequential execution
/// Given a diamond and max_parallel = 1
/// When the workflow runs
/// Then tasks run one at a time in a valid topological order
#[tokio::test]
async fn test_single_slot_runs_sequentially() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(5));
    let manager = manager_with(registry, RunPolicy::default().with_max_parallel(1));

    let state = manager.execute_graph(diamond("work")).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(recorder.peak(), 1);
    assert_eq!(recorder.started(), vec!["a", "b", "c", "d"]);
    assert_eq!(recorder.started(), recorder.finished());
}

/// Test: Priority ordering
/// Given independent tasks with different priorities and one slot
/// When the workflow runs
/// Then higher priorities are dispatched first
#[tokio::test]
async fn test_higher_priority_dispatches_first() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let graph = TaskGraph::from_tasks(vec![
        Task::new("low", "work").with_priority(1),
        Task::new("high", "work").with_priority(10),
        Task::new("mid", "work").with_priority(5),
    ])
    .unwrap();
    let manager = manager_with(registry, RunPolicy::default().with_max_parallel(1));

    manager.execute_graph(graph).await.unwrap();

    assert_eq!(recorder.started(), vec!["high", "mid", "low"]);
}

/// Test: Dispatch throttling
/// Given six tasks and a limit of two dispatches per 200ms window
/// When the workflow runs
/// Then the run spans at least one full window and still completes
#[tokio::test]
async fn test_rate_limit_throttles_dispatch() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));

    let backend = Arc::new(MemoryBackend::new());
    let limit = RateLimit::new(2, Duration::from_millis(200));
    let manager = WorkflowManager::new(
        StateStore::new(backend.clone()),
        Arc::new(registry),
        RunPolicy::default().with_max_parallel(6),
    )
    .with_rate_limit(RateLimiter::new(backend), limit);

    let start = Instant::now();
    let state = manager.execute_graph(independent("work", 6)).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(recorder.started().len(), 6);
    assert!(
        elapsed >= Duration::from_millis(200),
        "six dispatches at two per window took only {:?}",
        elapsed
    );
}

/// Test: Concurrent workflows
/// Given two workflows started on the same manager
/// When both run at once
/// Then both complete and both were active at the same time
#[tokio::test]
async fn test_workflows_run_concurrently() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(30));
    let manager = manager_with(registry, RunPolicy::default());

    let first = manager.prepare(diamond("work")).await.unwrap();
    let second = manager.prepare(diamond("work")).await.unwrap();

    let (m1, m2) = (manager.clone(), manager.clone());
    let h1 = tokio::spawn(async move { m1.execute(first, RunPolicy::default()).await });
    let h2 = tokio::spawn(async move { m2.execute(second, RunPolicy::default()).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.list_active().len(), 2);

    assert_eq!(h1.await.unwrap().unwrap().status, WorkflowStatus::Completed);
    assert_eq!(h2.await.unwrap().unwrap().status, WorkflowStatus::Completed);
    assert!(manager.list_active().is_empty());
}
