//! Built-in executors used by the command line front end.

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::core::{Task, TaskError, TaskErrorKind, TaskResult};

use super::{Executor, TaskContext};

/// Returns its input together with the outputs of its dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

impl Executor for EchoExecutor {
    fn execute(&self, task: Task, ctx: TaskContext) -> BoxFuture<'static, TaskResult> {
        async move {
            let mut dependencies = Map::new();
            for dep in &task.dependencies {
                match ctx.dependency_output(dep).await {
                    Ok(Some(output)) => {
                        dependencies.insert(dep.to_string(), output);
                    }
                    Ok(None) => {
                        dependencies.insert(dep.to_string(), Value::Null);
                    }
                    Err(e) => return TaskResult::failure(format!("reading {}: {}", dep, e)),
                }
            }
            trace!(task_id = %task.id, "echo");
            TaskResult::success(json!({
                "task": task.id.as_str(),
                "input": task.input,
                "dependencies": dependencies,
            }))
        }
        .boxed()
    }
}

/// Runs `input.command` with `sh -c`.
///
/// Optional `input.cwd` sets the working directory. The child sees
/// `CADENCE_WORKFLOW_ID` and `CADENCE_TASK_ID`, and is killed if the run
/// is cancelled or the attempt times out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    fn execute(&self, task: Task, ctx: TaskContext) -> BoxFuture<'static, TaskResult> {
        async move {
            let Some(command) = task.input.get("command").and_then(Value::as_str) else {
                return TaskResult::failure(format!("task {} has no string `command` input", task.id));
            };

            debug!(task_id = %task.id, command, "shell task");
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .env("CADENCE_WORKFLOW_ID", ctx.workflow_id().to_string())
                .env("CADENCE_TASK_ID", task.id.as_str())
                .kill_on_drop(true);
            if let Some(cwd) = task.input.get("cwd").and_then(Value::as_str) {
                cmd.current_dir(cwd);
            }

            let output = tokio::select! {
                output = cmd.output() => output,
                _ = ctx.cancellation().cancelled() => {
                    return TaskResult::Failure(TaskError::new(
                        TaskErrorKind::Cancelled,
                        "cancelled while running",
                    ));
                }
            };

            let output = match output {
                Ok(output) => output,
                Err(e) => return TaskResult::failure(format!("failed to spawn shell: {}", e)),
            };

            let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            if output.status.success() {
                TaskResult::success(json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": output.status.code(),
                }))
            } else {
                warn!(task_id = %task.id, status = %output.status, "shell task failed");
                TaskResult::failure(format!("command exited with {}: {}", output.status, stderr))
            }
        }
        .boxed()
    }
}
