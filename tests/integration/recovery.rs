//! Recovery and multi-process coordination tests.
//!
//! Separate `FileBackend` instances over one directory stand in for
//! separate orchestrator processes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use cadence::core::{TaskError, TaskErrorKind};
use cadence::state::{DistributedLock, FileBackend, KvBackend};
use cadence::{
    Error, ExecutorRegistry, RunPolicy, StateStore, TaskId, TaskStatus, WorkflowId,
    WorkflowManager, WorkflowState, WorkflowStatus,
};

use crate::fixtures::*;

fn file_backend(dir: &TempDir) -> Arc<dyn KvBackend> {
    Arc::new(FileBackend::new(dir.path()).unwrap())
}

/// Persist a diamond as if a process died with A done and B in flight.
async fn interrupted_diamond(store: &StateStore, status: WorkflowStatus) -> WorkflowId {
    let mut state = WorkflowState::new(WorkflowId::new(), diamond("work"));
    state.transition(WorkflowStatus::Running).unwrap();
    if status == WorkflowStatus::Paused {
        state.transition(WorkflowStatus::Paused).unwrap();
    }

    let a = TaskId::new("a");
    state.graph.get_task_mut(&a).unwrap().start();
    state.graph.get_task_mut(&a).unwrap().complete(json!({ "task": "a" }));
    state.context.insert("a".to_string(), json!({ "task": "a" }));
    store.set_value(&state.id, "a", &json!({ "task": "a" })).await.unwrap();
    state.graph.get_task_mut(&TaskId::new("b")).unwrap().start();
    state.recompute_progress();

    store.save_workflow(&state).await.unwrap();
    state.id
}

/// Test: Recovery after a crash
/// Given a stored run with A completed and B left Running
/// When another manager recovers it
/// Then only the unfinished tasks run and the workflow completes
#[tokio::test]
async fn test_recover_reruns_only_unfinished_tasks() {
    let dir = TempDir::new().unwrap();
    let id = interrupted_diamond(&StateStore::new(file_backend(&dir)), WorkflowStatus::Running).await;

    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = WorkflowManager::new(
        StateStore::new(file_backend(&dir)),
        Arc::new(registry),
        RunPolicy::default(),
    );

    let state = manager.recover(id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(recorder.attempts("a"), 0);
    assert_eq!(recorder.attempts("b"), 1);
    assert_eq!(recorder.started().len(), 3);
    let a = state.graph.get_task(&TaskId::new("a")).unwrap();
    assert_eq!(a.output, Some(json!({ "task": "a" })));
}

/// Test: Recovering a paused run
/// Given a stored run that was paused
/// When it is recovered
/// Then it resumes and completes
#[tokio::test]
async fn test_recover_resumes_paused_run() {
    let store = memory_store();
    let id = interrupted_diamond(&store, WorkflowStatus::Paused).await;

    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = WorkflowManager::new(store, Arc::new(registry), RunPolicy::default());

    let state = manager.recover(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(recorder.attempts("a"), 0);
}

/// Test: Recovery after a critical failure
/// Given a stored run whose critical task A already failed, with B left
/// Running and C never started
/// When it is recovered
/// Then nothing new is dispatched and the workflow ends Failed
#[tokio::test]
async fn test_recover_honours_earlier_critical_failure() {
    let store = memory_store();
    let graph = graph_of("work", &[("a", &[]), ("b", &[]), ("c", &[])]);
    let mut state = WorkflowState::new(WorkflowId::new(), graph);
    state.transition(WorkflowStatus::Running).unwrap();
    let a = state.graph.get_task_mut(&TaskId::new("a")).unwrap();
    a.start();
    a.fail(TaskError::new(TaskErrorKind::Execution, "boom"));
    state.graph.get_task_mut(&TaskId::new("b")).unwrap().start();
    state.recompute_progress();
    store.save_workflow(&state).await.unwrap();

    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = WorkflowManager::new(store, Arc::new(registry), RunPolicy::default());

    let recovered = manager.recover(state.id).await.unwrap();

    assert_eq!(recovered.status, WorkflowStatus::Failed);
    assert!(recorder.started().is_empty());
    let c = recovered.graph.get_task(&TaskId::new("c")).unwrap();
    assert_eq!(c.status, TaskStatus::Pending);
}

/// Test: Recovering a finished run
/// Given a completed workflow
/// When recovery is requested
/// Then it is rejected
#[tokio::test]
async fn test_recover_rejects_terminal_workflow() {
    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = manager_with(registry, RunPolicy::default());

    let state = manager.execute_graph(diamond("work")).await.unwrap();
    assert!(matches!(
        manager.recover(state.id).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        manager.recover(WorkflowId::new()).await,
        Err(Error::WorkflowNotFound(_))
    ));
}

/// Test: Lock exclusion across processes
/// Given two lock clients over the same directory
/// When one holds a lock
/// Then the other cannot take it until the TTL lapses
#[tokio::test]
async fn test_lock_is_exclusive_across_backends() {
    let dir = TempDir::new().unwrap();
    let first = DistributedLock::new(file_backend(&dir));
    let second = DistributedLock::new(file_backend(&dir));
    let ttl = Duration::from_millis(300);

    let guard = first.acquire("workflow:shared", ttl).await.unwrap().unwrap();
    assert!(second.acquire("workflow:shared", ttl).await.unwrap().is_none());
    assert!(matches!(
        second
            .acquire_timeout("workflow:shared", ttl, Duration::from_millis(50))
            .await,
        Err(Error::LockUnavailable(_))
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let taken_over = second.acquire("workflow:shared", ttl).await.unwrap();
    assert!(taken_over.is_some());

    // The first holder's guard is stale and must not free the new lock.
    assert!(!first.release(guard).await.unwrap());
    assert!(second.release(taken_over.unwrap()).await.unwrap());
}

/// Test: Locked snapshots on a shared store
/// Given a manager writing through the distributed lock to a file store
/// When a workflow runs
/// Then a second process sees the final state and no lock is left behind
#[tokio::test]
async fn test_locked_run_on_file_store() {
    let dir = TempDir::new().unwrap();
    let backend = file_backend(&dir);

    let recorder = Recorder::new();
    let mut registry = ExecutorRegistry::new();
    recorder.register(&mut registry, "work", Duration::from_millis(1));
    let manager = WorkflowManager::new(
        StateStore::new(Arc::clone(&backend)),
        Arc::new(registry),
        RunPolicy::default(),
    )
    .with_lock(DistributedLock::new(Arc::clone(&backend)), Duration::from_secs(2));

    let state = manager.execute_graph(diamond("work")).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);

    let observer = StateStore::new(file_backend(&dir));
    let stored = observer.get_workflow(&state.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    let d = observer
        .get_task(&state.id, &TaskId::new("d"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(d.status, TaskStatus::Completed);
    assert_eq!(
        observer.get_value(&state.id, "d").await.unwrap(),
        Some(json!({ "task": "d" }))
    );
    assert!(backend.keys("lock:").unwrap().is_empty());
}
