//! Driver loop for a single workflow run.
//!
//! The driver owns the run's `WorkflowState` and all scheduling bookkeeping.
//! Executor calls run as spawned tasks in a `JoinSet` and report back
//! through `join_next`, so no scheduling state is shared across tasks.
//! Retry delays sit in a `DelayQueue` and control signals arrive on a
//! `watch` channel; the loop wakes on whichever happens first.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::core::{Task, TaskError, TaskErrorKind, TaskId, TaskResult, TaskStatus};
use crate::executor::{Executor, ExecutorRegistry, TaskContext};
use crate::state::{DistributedLock, EventBus, RateLimit, RateLimiter, StateStore};
use crate::util::events_channel;
use crate::workflow::{Event, EventKind, WorkflowState, WorkflowStatus};
use crate::{Error, Result};

use super::RunPolicy;

/// Rate limiter key shared by every run on the same backend.
pub const DISPATCH_RATE_KEY: &str = "dispatch";

/// Requested run mode, sent from the manager to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug, Clone)]
pub(crate) struct LockSettings {
    pub lock: DistributedLock,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct Throttle {
    pub limiter: RateLimiter,
    pub limit: RateLimit,
}

/// Shared collaborators handed to each driver.
#[derive(Debug, Clone)]
pub(crate) struct Services {
    pub store: StateStore,
    pub registry: Arc<ExecutorRegistry>,
    pub bus: Arc<EventBus>,
    pub lock: Option<LockSettings>,
    pub throttle: Option<Throttle>,
}

enum Wake {
    Joined(Option<std::result::Result<(TaskId, TaskResult), JoinError>>),
    RetryDue(Option<TaskId>),
    Control(bool),
    RateWindow,
    GraceElapsed,
    Idle,
}

pub(crate) struct Driver {
    state: WorkflowState,
    policy: RunPolicy,
    services: Services,
    channel: String,
    control: watch::Receiver<Control>,
    control_open: bool,
    mode: Control,
    cancel: CancellationToken,
    running: JoinSet<(TaskId, TaskResult)>,
    active: HashMap<TaskId, Instant>,
    completed: HashSet<TaskId>,
    retries: DelayQueue<TaskId>,
    waiting_retry: HashMap<TaskId, Key>,
    rate_wake: Option<Instant>,
    grace_deadline: Option<Instant>,
    critical_failure: bool,
}

impl Driver {
    pub(crate) fn new(
        state: WorkflowState,
        policy: RunPolicy,
        services: Services,
        control: watch::Receiver<Control>,
        cancel: CancellationToken,
    ) -> Self {
        let completed = state
            .graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        // A recovered run may already have lost a critical task.
        let critical_failure = state
            .graph
            .tasks()
            .any(|t| t.critical && t.status == TaskStatus::Failed);
        Self {
            channel: events_channel(&state.id),
            state,
            policy,
            services,
            control,
            control_open: true,
            mode: Control::Run,
            cancel,
            running: JoinSet::new(),
            active: HashMap::new(),
            completed,
            retries: DelayQueue::new(),
            waiting_retry: HashMap::new(),
            rate_wake: None,
            grace_deadline: None,
            critical_failure,
        }
    }

    /// Drive the run to a terminal status.
    ///
    /// On an infrastructure error the run stops at once: in-flight executors
    /// are signalled through the cancellation token and detached, and the
    /// store keeps the last snapshot that was written.
    pub(crate) async fn run(mut self) -> Result<WorkflowState> {
        match self.drive().await {
            Ok(()) => Ok(self.state),
            Err(e) => {
                error!(workflow_id = %self.state.id, error = %e, "workflow run aborted");
                self.cancel.cancel();
                self.running.detach_all();
                self.services.bus.close(&self.channel);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        if self.state.status == WorkflowStatus::Pending {
            self.state.transition(WorkflowStatus::Running)?;
        }
        info!(
            workflow_id = %self.state.id,
            tasks = self.state.graph.task_count(),
            max_parallel = self.policy.max_parallel,
            "workflow run started"
        );
        self.state.recompute_progress();
        self.persist().await?;

        loop {
            self.sync_control().await?;
            self.dispatch().await?;
            self.skip_stranded().await?;
            if self.is_done() {
                break;
            }

            match self.wait().await {
                Wake::Joined(Some(Ok((task_id, result)))) => self.settle(task_id, result).await?,
                Wake::Joined(Some(Err(e))) => return Err(Error::TaskJoin(e.to_string())),
                Wake::Joined(None) | Wake::RetryDue(None) | Wake::Control(true) => {}
                Wake::RetryDue(Some(task_id)) => self.retry_due(&task_id),
                Wake::Control(false) => self.control_open = false,
                Wake::RateWindow => self.rate_wake = None,
                Wake::GraceElapsed => self.abandon_in_flight().await?,
                Wake::Idle => {
                    warn!(workflow_id = %self.state.id, "nothing left to wait on; ending run");
                    break;
                }
            }
        }

        self.finish().await
    }

    async fn wait(&mut self) -> Wake {
        let has_active = !self.running.is_empty();
        let has_retry = !self.retries.is_empty();
        let control_open = self.control_open;
        let far = Instant::now() + Duration::from_secs(24 * 60 * 60);
        let rate_at = self.rate_wake;
        let grace_at = self.grace_deadline.filter(|_| has_active);

        tokio::select! {
            joined = self.running.join_next(), if has_active => Wake::Joined(joined),
            expired = self.retries.next(), if has_retry => {
                Wake::RetryDue(expired.map(|e| e.into_inner()))
            }
            changed = self.control.changed(), if control_open => Wake::Control(changed.is_ok()),
            _ = sleep_until(rate_at.unwrap_or(far)), if rate_at.is_some() => Wake::RateWindow,
            _ = sleep_until(grace_at.unwrap_or(far)), if grace_at.is_some() => Wake::GraceElapsed,
            else => Wake::Idle,
        }
    }

    fn stopping(&self) -> bool {
        self.mode == Control::Cancel || self.critical_failure
    }

    fn is_done(&self) -> bool {
        if !self.active.is_empty() {
            return false;
        }
        if self.stopping() {
            return true;
        }
        if self.mode == Control::Pause {
            return false;
        }
        self.waiting_retry.is_empty()
            && self.rate_wake.is_none()
            && self.state.graph.tasks().all(Task::is_finished)
    }

    /// Apply the latest requested mode.
    async fn sync_control(&mut self) -> Result<()> {
        let requested = *self.control.borrow_and_update();
        if requested == self.mode || self.mode == Control::Cancel {
            return Ok(());
        }

        match requested {
            Control::Cancel => {
                info!(workflow_id = %self.state.id, active = self.active.len(), "cancelling workflow");
                self.mode = Control::Cancel;
                self.cancel.cancel();
                self.retries.clear();
                self.waiting_retry.clear();
                self.rate_wake = None;
                self.grace_deadline = Some(Instant::now() + self.policy.cancel_grace);
            }
            Control::Pause => {
                self.state.transition(WorkflowStatus::Paused)?;
                self.mode = Control::Pause;
                info!(workflow_id = %self.state.id, "workflow paused");
                self.persist().await?;
                self.publish(Event::workflow(self.state.id, EventKind::WorkflowPaused, json!({})))?;
            }
            Control::Run => {
                self.state.transition(WorkflowStatus::Running)?;
                self.mode = Control::Run;
                info!(workflow_id = %self.state.id, "workflow resumed");
                self.persist().await?;
                self.publish(Event::workflow(self.state.id, EventKind::WorkflowResumed, json!({})))?;
            }
        }
        Ok(())
    }

    /// Start ready tasks while capacity and the rate limit allow.
    async fn dispatch(&mut self) -> Result<()> {
        if self.stopping() || self.mode == Control::Pause || self.rate_wake.is_some() {
            return Ok(());
        }

        let ready: Vec<TaskId> = self
            .state
            .graph
            .ready_tasks(&self.completed)
            .into_iter()
            .filter(|id| !self.active.contains_key(id) && !self.waiting_retry.contains_key(id))
            .collect();

        for task_id in ready {
            if self.active.len() >= self.policy.max_parallel {
                if let Some(task) = self.state.graph.get_task_mut(&task_id) {
                    if task.status == TaskStatus::Pending {
                        task.mark_ready();
                    }
                }
                continue;
            }

            if let Some(throttle) = &self.services.throttle {
                if !throttle.limiter.check(DISPATCH_RATE_KEY, throttle.limit).await? {
                    let wait = RateLimiter::retry_after(throttle.limit);
                    debug!(workflow_id = %self.state.id, wait_ms = wait.as_millis() as u64, "dispatch rate limited");
                    self.rate_wake = Some(Instant::now() + wait);
                    break;
                }
            }

            self.launch(task_id).await?;
        }
        Ok(())
    }

    async fn launch(&mut self, task_id: TaskId) -> Result<()> {
        let kind = self
            .state
            .graph
            .get_task(&task_id)
            .map(|t| t.kind.clone())
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

        let Some(executor) = self.services.registry.get(&kind) else {
            let error = TaskError::execution(format!("no executor registered for kind {}", kind));
            self.fail_permanently(&task_id, error)?;
            return self.after_settlement().await;
        };

        let snapshot = {
            let task = self
                .state
                .graph
                .get_task_mut(&task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            task.start();
            task.clone()
        };
        let attempt = snapshot.retry_count + 1;

        self.services.store.save_task(&self.state.id, &snapshot).await?;
        self.publish(Event::task(
            self.state.id,
            task_id.clone(),
            EventKind::TaskStarted,
            json!({ "attempt": attempt, "stage": snapshot.stage }),
        ))?;
        debug!(workflow_id = %self.state.id, task_id = %task_id, attempt, "task dispatched");

        let ctx = TaskContext::new(self.state.id, self.services.store.clone(), self.cancel.clone());
        self.active.insert(task_id, Instant::now());
        self.running
            .spawn(run_attempt(executor, snapshot, ctx, self.policy.task_timeout));
        Ok(())
    }

    async fn settle(&mut self, task_id: TaskId, result: TaskResult) -> Result<()> {
        let started = self.active.remove(&task_id);
        let elapsed_ms = started.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);

        match result {
            TaskResult::Success(output) => {
                // Dependents may only start once the output is readable.
                self.services
                    .store
                    .set_value(&self.state.id, task_id.as_str(), &output)
                    .await?;
                self.state.context.insert(task_id.to_string(), output.clone());

                let task = self
                    .state
                    .graph
                    .get_task_mut(&task_id)
                    .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
                task.complete(output);
                let attempt = task.retry_count + 1;
                self.completed.insert(task_id.clone());

                debug!(workflow_id = %self.state.id, task_id = %task_id, elapsed_ms, "task completed");
                self.publish(Event::task(
                    self.state.id,
                    task_id,
                    EventKind::TaskCompleted,
                    json!({ "attempt": attempt, "elapsed_ms": elapsed_ms }),
                ))?;
            }
            TaskResult::Failure(error) => {
                let stopping = self.stopping();
                let max_retries = self.policy.max_retries;
                let task = self
                    .state
                    .graph
                    .get_task_mut(&task_id)
                    .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
                task.retry_count += 1;
                let retry_count = task.retry_count;
                let retryable = !stopping
                    && error.kind != TaskErrorKind::Cancelled
                    && retry_count <= task.retry_limit(max_retries);

                if retryable {
                    let delay = self.policy.backoff_for(retry_count);
                    task.await_retry(error.clone());
                    let key = self.retries.insert(task_id.clone(), delay);
                    self.waiting_retry.insert(task_id.clone(), key);

                    warn!(
                        workflow_id = %self.state.id,
                        task_id = %task_id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "task failed, retrying"
                    );
                    self.publish(Event::task(
                        self.state.id,
                        task_id,
                        EventKind::TaskRetrying,
                        json!({
                            "retry_count": retry_count,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error.message,
                        }),
                    ))?;
                } else {
                    self.fail_permanently(&task_id, error)?;
                }
            }
        }

        self.after_settlement().await
    }

    /// Mark a task Failed, skip everything downstream of it, and stop
    /// dispatch if it was critical.
    fn fail_permanently(&mut self, task_id: &TaskId, error: TaskError) -> Result<()> {
        let task = self
            .state
            .graph
            .get_task_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        task.fail(error.clone());
        let critical = task.critical;
        let retry_count = task.retry_count;

        self.state.record_error(format!("{}: {}", task_id, error.message));
        warn!(
            workflow_id = %self.state.id,
            task_id = %task_id,
            retry_count,
            critical,
            error = %error,
            "task failed permanently"
        );
        self.publish(Event::task(
            self.state.id,
            task_id.clone(),
            EventKind::TaskFailed,
            json!({
                "error": error.message,
                "kind": error.kind,
                "retry_count": retry_count,
                "critical": critical,
            }),
        ))?;

        let mut skipped = Vec::new();
        for descendant in self.state.graph.descendants_of(task_id) {
            if self.active.contains_key(&descendant) {
                continue;
            }
            if let Some(task) = self.state.graph.get_task_mut(&descendant) {
                if task.is_finished() {
                    continue;
                }
                if let Some(key) = self.waiting_retry.remove(&descendant) {
                    self.retries.remove(&key);
                }
                task.skip(TaskError::dependency_failed(task_id));
                skipped.push(descendant);
            }
        }
        for descendant in skipped {
            debug!(workflow_id = %self.state.id, task_id = %descendant, cause = %task_id, "task skipped");
            self.publish(Event::task(
                self.state.id,
                descendant,
                EventKind::TaskSkipped,
                json!({ "dependency": task_id.as_str() }),
            ))?;
        }

        if critical && !self.critical_failure {
            info!(workflow_id = %self.state.id, task_id = %task_id, "critical task failed, dispatch stopped");
            self.critical_failure = true;
            self.retries.clear();
            self.waiting_retry.clear();
        }
        Ok(())
    }

    fn retry_due(&mut self, task_id: &TaskId) {
        self.waiting_retry.remove(task_id);
        if let Some(task) = self.state.graph.get_task_mut(task_id) {
            if task.status == TaskStatus::Pending {
                task.mark_ready();
            }
        }
        debug!(workflow_id = %self.state.id, task_id = %task_id, "retry due");
    }

    /// Skip tasks that can never become ready because an ancestor ended
    /// without completing.
    async fn skip_stranded(&mut self) -> Result<()> {
        if self.stopping()
            || self.mode == Control::Pause
            || !self.active.is_empty()
            || !self.waiting_retry.is_empty()
            || self.rate_wake.is_some()
            || !self.state.graph.ready_tasks(&self.completed).is_empty()
        {
            return Ok(());
        }

        let stranded: Vec<(TaskId, TaskId)> = self
            .state
            .graph
            .tasks()
            .filter(|t| !t.is_finished())
            .map(|t| {
                let blocker = t
                    .dependencies
                    .iter()
                    .find(|d| !self.completed.contains(*d))
                    .cloned()
                    .unwrap_or_else(|| t.id.clone());
                (t.id.clone(), blocker)
            })
            .collect();
        if stranded.is_empty() {
            return Ok(());
        }

        for (task_id, blocker) in &stranded {
            if let Some(task) = self.state.graph.get_task_mut(task_id) {
                task.skip(TaskError::dependency_failed(blocker));
            }
        }
        for (task_id, blocker) in stranded {
            debug!(workflow_id = %self.state.id, task_id = %task_id, cause = %blocker, "stranded task skipped");
            self.publish(Event::task(
                self.state.id,
                task_id,
                EventKind::TaskSkipped,
                json!({ "dependency": blocker.as_str() }),
            ))?;
        }
        self.after_settlement().await
    }

    /// Give up on tasks that ignored cancellation past the grace period.
    async fn abandon_in_flight(&mut self) -> Result<()> {
        let abandoned: Vec<TaskId> = self.active.drain().map(|(id, _)| id).collect();
        self.running.detach_all();
        warn!(
            workflow_id = %self.state.id,
            count = abandoned.len(),
            "cancel grace elapsed, detaching in-flight tasks"
        );

        for task_id in abandoned {
            if let Some(task) = self.state.graph.get_task_mut(&task_id) {
                task.fail(TaskError::new(
                    TaskErrorKind::Cancelled,
                    "abandoned after cancel grace period",
                ));
            }
            self.publish(Event::task(
                self.state.id,
                task_id,
                EventKind::TaskFailed,
                json!({ "kind": TaskErrorKind::Cancelled }),
            ))?;
        }
        self.after_settlement().await
    }

    async fn after_settlement(&mut self) -> Result<()> {
        let percent = self.state.recompute_progress();
        self.persist().await?;
        self.publish(Event::workflow(
            self.state.id,
            EventKind::ProgressUpdated,
            json!({
                "progress_percent": percent,
                "finished": self.state.graph.finished_count(),
                "total": self.state.graph.task_count(),
            }),
        ))
    }

    async fn finish(&mut self) -> Result<()> {
        let critical_lost = self.state.graph.tasks().any(|t| {
            t.critical && matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped)
        });
        let (status, kind) = if self.mode == Control::Cancel {
            (WorkflowStatus::Cancelled, EventKind::WorkflowCancelled)
        } else if self.critical_failure || critical_lost {
            (WorkflowStatus::Failed, EventKind::WorkflowFailed)
        } else {
            (WorkflowStatus::Completed, EventKind::WorkflowCompleted)
        };

        let percent = self.state.recompute_progress();
        self.state.transition(status)?;
        self.persist().await?;
        self.publish(Event::workflow(
            self.state.id,
            kind,
            json!({ "progress_percent": percent, "errors": self.state.errors }),
        ))?;
        self.services.bus.close(&self.channel);

        info!(
            workflow_id = %self.state.id,
            status = %status,
            progress = percent,
            errors = self.state.errors.len(),
            "workflow run finished"
        );
        Ok(())
    }

    /// Write the workflow snapshot, under the distributed lock if one is
    /// configured.
    async fn persist(&mut self) -> Result<()> {
        let Some(settings) = &self.services.lock else {
            return self.services.store.save_workflow(&self.state).await;
        };

        let name = format!("workflow:{}", self.state.id);
        let guard = settings
            .lock
            .acquire_timeout(&name, settings.ttl, settings.ttl)
            .await?;
        let saved = self.services.store.save_workflow(&self.state).await;
        settings.lock.release(guard).await?;
        saved
    }

    fn publish(&self, event: Event) -> Result<()> {
        self.services.bus.publish(&self.channel, event)?;
        Ok(())
    }
}

/// One executor attempt with panic containment and the optional timeout.
async fn run_attempt(
    executor: Arc<dyn Executor>,
    task: Task,
    ctx: TaskContext,
    timeout: Option<Duration>,
) -> (TaskId, TaskResult) {
    let task_id = task.id.clone();
    let attempt = AssertUnwindSafe(async move { executor.execute(task, ctx).await }).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => return (task_id, TaskResult::Failure(TaskError::timeout(limit))),
        },
        None => attempt.await,
    };

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => TaskResult::failure(format!("executor panicked: {}", panic_message(&*panic))),
    };
    (task_id, result)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
