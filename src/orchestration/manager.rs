//! WorkflowManager - the control surface for workflow runs.
//!
//! The manager persists new workflows, starts a driver per run, and routes
//! pause, resume and cancel requests to live runs through their
//! `RunHandle`. Status queries always read the store, so they also work
//! for runs owned by another process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{TaskGraph, TaskStatus};
use crate::executor::ExecutorRegistry;
use crate::state::{DistributedLock, EventBus, EventStream, RateLimit, RateLimiter, StateStore};
use crate::util::events_channel;
use crate::workflow::{Event, EventKind, StatusReport, WorkflowId, WorkflowState, WorkflowStatus};
use crate::{Error, Result};

use super::driver::{Control, Driver, LockSettings, Services, Throttle};
use super::RunPolicy;

/// Control side of a live run.
struct RunHandle {
    control: watch::Sender<Control>,
    cancel: CancellationToken,
}

type RunTable = Arc<Mutex<HashMap<WorkflowId, RunHandle>>>;

/// Removes a run from the table when its driver returns.
struct Registration {
    runs: RunTable,
    id: WorkflowId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&self.id);
        }
    }
}

fn table_poisoned() -> Error {
    Error::Infrastructure("run table lock poisoned".to_string())
}

/// Entry point for preparing, running and controlling workflows.
///
/// Cloning is cheap; clones share the store, event bus and run table, so a
/// run started from one clone can be paused from another.
///
/// # Example
///
/// ```ignore
/// let manager = WorkflowManager::new(store, Arc::new(registry), RunPolicy::default());
/// let id = manager.prepare(graph).await?;
/// let mut events = manager.subscribe(id).await?;
/// let state = manager.execute(id, RunPolicy::default().with_max_parallel(2)).await?;
/// ```
#[derive(Clone)]
pub struct WorkflowManager {
    store: StateStore,
    registry: Arc<ExecutorRegistry>,
    policy: RunPolicy,
    bus: Arc<EventBus>,
    lock: Option<LockSettings>,
    throttle: Option<Throttle>,
    runs: RunTable,
}

impl WorkflowManager {
    pub fn new(store: StateStore, registry: Arc<ExecutorRegistry>, policy: RunPolicy) -> Self {
        Self {
            store,
            registry,
            policy,
            bus: Arc::new(EventBus::default()),
            lock: None,
            throttle: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Guard every workflow snapshot write with `lock`, held for at most `ttl`.
    pub fn with_lock(mut self, lock: DistributedLock, ttl: Duration) -> Self {
        self.lock = Some(LockSettings { lock, ttl });
        self
    }

    /// Throttle task dispatch across all runs sharing the backend.
    pub fn with_rate_limit(mut self, limiter: RateLimiter, limit: RateLimit) -> Self {
        self.throttle = Some(Throttle { limiter, limit });
        self
    }

    /// Publish events on an existing bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn policy(&self) -> RunPolicy {
        self.policy
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Persist a new Pending workflow for `graph`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExecutor` if any task kind has no executor.
    pub async fn prepare(&self, graph: TaskGraph) -> Result<WorkflowId> {
        if let Some(task) = graph.tasks().find(|t| !self.registry.contains(&t.kind)) {
            return Err(Error::UnknownExecutor(task.kind.clone()));
        }

        let state = WorkflowState::new(WorkflowId::new(), graph);
        self.store.save_workflow(&state).await?;
        info!(
            workflow_id = %state.id,
            tasks = state.graph.task_count(),
            "workflow prepared"
        );
        Ok(state.id)
    }

    /// Run a prepared workflow to a terminal status.
    ///
    /// Task failures are recorded in the returned state. Only
    /// infrastructure errors (store, lock, bus) are returned as `Err`.
    pub async fn execute(&self, id: WorkflowId, policy: RunPolicy) -> Result<WorkflowState> {
        policy.validate()?;
        let state = self.load(&id).await?;
        if state.status != WorkflowStatus::Pending {
            return Err(Error::InvalidTransition {
                from: state.status.to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }
        self.run(state, policy).await
    }

    /// Prepare and execute `graph` with the manager's default policy.
    pub async fn execute_graph(&self, graph: TaskGraph) -> Result<WorkflowState> {
        let id = self.prepare(graph).await?;
        self.execute(id, self.policy).await
    }

    /// Resume an interrupted run from its last persisted snapshot.
    ///
    /// Tasks that were Running or Ready are reset to Pending and run again;
    /// Completed tasks keep their outputs. A Paused run resumes.
    pub async fn recover(&self, id: WorkflowId) -> Result<WorkflowState> {
        let mut state = self.load(&id).await?;
        if state.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: state.status.to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }

        if state.status == WorkflowStatus::Paused {
            state.transition(WorkflowStatus::Running)?;
        }

        let mut reset = 0;
        for task_id in state.graph.task_ids() {
            if let Some(task) = state.graph.get_task_mut(&task_id) {
                if matches!(task.status, TaskStatus::Running | TaskStatus::Ready) {
                    task.reset();
                    reset += 1;
                }
            }
        }
        info!(workflow_id = %id, status = %state.status, reset, "recovering workflow");
        self.run(state, self.policy).await
    }

    async fn run(&self, state: WorkflowState, policy: RunPolicy) -> Result<WorkflowState> {
        let (registration, control, cancel) = self.register(state.id)?;
        let services = Services {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            lock: self.lock.clone(),
            throttle: self.throttle.clone(),
        };
        let result = Driver::new(state, policy, services, control, cancel).run().await;
        drop(registration);
        result
    }

    fn register(
        &self,
        id: WorkflowId,
    ) -> Result<(Registration, watch::Receiver<Control>, CancellationToken)> {
        let mut runs = self.runs.lock().map_err(|_| table_poisoned())?;
        if runs.contains_key(&id) {
            return Err(Error::Validation(format!("workflow {} is already running", id)));
        }
        let (control, rx) = watch::channel(Control::Run);
        let cancel = CancellationToken::new();
        runs.insert(
            id,
            RunHandle {
                control,
                cancel: cancel.clone(),
            },
        );
        Ok((
            Registration {
                runs: Arc::clone(&self.runs),
                id,
            },
            rx,
            cancel,
        ))
    }

    /// Stop dispatching new tasks. In-flight tasks still finish.
    pub async fn pause(&self, id: WorkflowId) -> Result<()> {
        self.signal(id, Control::Pause).await
    }

    /// Resume dispatch after `pause`.
    pub async fn resume(&self, id: WorkflowId) -> Result<()> {
        self.signal(id, Control::Run).await
    }

    /// Cancel a run.
    ///
    /// Dispatch stops and executors see their cancellation token fire.
    /// Tasks still running after the policy's grace period are detached.
    /// A prepared workflow that never started is cancelled in the store.
    pub async fn cancel(&self, id: WorkflowId) -> Result<()> {
        self.signal(id, Control::Cancel).await
    }

    async fn signal(&self, id: WorkflowId, control: Control) -> Result<()> {
        {
            let runs = self.runs.lock().map_err(|_| table_poisoned())?;
            if let Some(handle) = runs.get(&id) {
                let current = *handle.control.borrow();
                if current == Control::Cancel {
                    return Err(Error::InvalidTransition {
                        from: WorkflowStatus::Cancelled.to_string(),
                        to: target_status(control).to_string(),
                    });
                }
                handle.control.send_replace(control);
                if control == Control::Cancel {
                    handle.cancel.cancel();
                }
                debug!(workflow_id = %id, ?control, "control signal sent");
                return Ok(());
            }
        }

        let mut state = self.load(&id).await?;
        if control == Control::Cancel && state.status == WorkflowStatus::Pending {
            state.transition(WorkflowStatus::Cancelled)?;
            self.store.save_workflow(&state).await?;
            let channel = events_channel(&id);
            self.bus.publish(
                &channel,
                Event::workflow(id, EventKind::WorkflowCancelled, json!({ "progress_percent": state.progress_percent })),
            )?;
            self.bus.close(&channel);
            info!(workflow_id = %id, "prepared workflow cancelled");
            return Ok(());
        }

        Err(Error::InvalidTransition {
            from: state.status.to_string(),
            to: target_status(control).to_string(),
        })
    }

    /// Ids of runs currently driven by this manager, sorted.
    pub fn list_active(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self
            .runs
            .lock()
            .map(|runs| runs.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn is_active(&self, id: &WorkflowId) -> bool {
        self.runs
            .lock()
            .map(|runs| runs.contains_key(id))
            .unwrap_or(false)
    }

    /// Progress view read from the store.
    pub async fn get_status(&self, id: WorkflowId) -> Result<StatusReport> {
        Ok(self.load(&id).await?.report())
    }

    /// Full persisted state of a workflow.
    pub async fn get_state(&self, id: WorkflowId) -> Result<WorkflowState> {
        self.load(&id).await
    }

    /// Ids of every workflow in the store.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowId>> {
        self.store.list_workflows().await
    }

    /// Subscribe to a workflow's events.
    ///
    /// Subscribing to a finished workflow yields a stream that ends
    /// immediately.
    pub async fn subscribe(&self, id: WorkflowId) -> Result<EventStream> {
        let state = self.load(&id).await?;
        let channel = events_channel(&id);
        let stream = self.bus.subscribe(&channel)?;
        if state.status.is_terminal() && !self.is_active(&id) {
            self.bus.close(&channel);
        }
        Ok(stream)
    }

    /// Remove a workflow that is not running. Returns `WorkflowNotFound`
    /// if nothing was stored under `id`.
    pub async fn delete(&self, id: WorkflowId) -> Result<()> {
        if self.is_active(&id) {
            return Err(Error::Validation(format!(
                "workflow {} is running and cannot be deleted",
                id
            )));
        }
        if !self.store.delete_workflow(&id).await? {
            return Err(Error::WorkflowNotFound(id));
        }
        info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    async fn load(&self, id: &WorkflowId) -> Result<WorkflowState> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or(Error::WorkflowNotFound(*id))
    }
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("policy", &self.policy)
            .field("registry", &self.registry)
            .field("active", &self.list_active())
            .finish_non_exhaustive()
    }
}

fn target_status(control: Control) -> WorkflowStatus {
    match control {
        Control::Run => WorkflowStatus::Running,
        Control::Pause => WorkflowStatus::Paused,
        Control::Cancel => WorkflowStatus::Cancelled,
    }
}
