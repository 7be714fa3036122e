use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};

use crate::extensions::registry::panic_message;
use crate::extensions::{Task, TaskError};
use crate::worker::executor::ProcessExecutor;
use crate::worker::status::{StatusUpdate, TaskOutcome};

/// Admits delivered tasks into execution under the capacity ceiling.
///
/// Per iteration: take a capacity permit, take the next task in FIFO order,
/// spawn its execution and move on. The semaphore is the only throttle; the
/// inbound queue itself is unbounded.
pub struct ExecutionScheduler {
    inbound: mpsc::UnboundedReceiver<Box<dyn Task>>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    capacity: Arc<Semaphore>,
    logs_dir: PathBuf,
    executions: TaskTracker,
    /// Cancels this loop
    cancel: CancellationToken,
    /// Cancels in-flight executions
    execution_cancel: CancellationToken,
}

impl ExecutionScheduler {
    pub fn new(
        inbound: mpsc::UnboundedReceiver<Box<dyn Task>>,
        status_tx: mpsc::UnboundedSender<StatusUpdate>,
        capacity: Arc<Semaphore>,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inbound,
            status_tx,
            capacity,
            logs_dir: logs_dir.into(),
            executions: TaskTracker::new(),
            cancel: CancellationToken::new(),
            execution_cancel: CancellationToken::new(),
        }
    }

    /// Track spawned executions in `executions` instead of a private tracker.
    pub fn with_executions(mut self, executions: TaskTracker) -> Self {
        self.executions = executions;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken, execution_cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self.execution_cancel = execution_cancel;
        self
    }

    pub fn executions(&self) -> TaskTracker {
        self.executions.clone()
    }

    pub async fn run(mut self) {
        tracing::debug!("Task execute loop started");

        loop {
            tracing::trace!(available = self.capacity.available_permits(), "Acquiring capacity permit");
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.capacity.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::debug!("Capacity semaphore closed");
                        break;
                    }
                },
            };
            tracing::trace!("Acquired capacity permit");

            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = self.inbound.recv() => match task {
                    Some(task) => task,
                    None => {
                        tracing::debug!("Inbound task queue closed");
                        break;
                    }
                },
            };
            tracing::trace!(task = ?task, "Got task from queue");

            self.executions.spawn(execute_task(
                task,
                permit,
                self.logs_dir.clone(),
                self.status_tx.clone(),
                self.execution_cancel.clone(),
            ));
        }

        tracing::debug!("Task execute loop stopped");
    }
}

/// Execute one task and enqueue exactly one outcome for it.
///
/// The permit is owned by this future, so it is released on every exit path,
/// including cancellation and abort.
async fn execute_task(
    task: Box<dyn Task>,
    permit: OwnedSemaphorePermit,
    logs_dir: PathBuf,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    cancel: CancellationToken,
) {
    let _permit = permit;
    let header = task.header().clone();
    tracing::info!(
        job_id = %header.job_id,
        task_id = %header.task_id,
        task_type = %header.task_type,
        "Start to exec task"
    );

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::warn!(job_id = %header.job_id, task_id = %header.task_id, "Task execution cancelled");
            return;
        }
        outcome = run_task(task, logs_dir) => outcome,
    };

    match &outcome {
        TaskOutcome::Finished(_) => {
            tracing::info!(job_id = %header.job_id, task_id = %header.task_id, "Finish exec task");
        }
        TaskOutcome::Failed(error) => {
            tracing::error!(job_id = %header.job_id, task_id = %header.task_id, error = %error, "Task execution failed");
        }
    }

    if status_tx.send(StatusUpdate::report(&header, outcome)).is_err() {
        tracing::debug!(
            job_id = %header.job_id,
            task_id = %header.task_id,
            "Status queue closed, outcome dropped"
        );
    }
}

async fn run_task(task: Box<dyn Task>, logs_dir: PathBuf) -> TaskOutcome {
    let header = task.header();
    let executor = match ProcessExecutor::for_task(&logs_dir, &header.job_id, &header.task_id) {
        Ok(executor) => executor,
        Err(e) => return TaskOutcome::Failed(e.to_string()),
    };

    // Dropping the handle (cancellation) aborts the task body.
    let handle = AbortOnDropHandle::new(tokio::spawn(async move { task.exec(&executor).await }));

    match handle.await {
        Ok(Ok(result)) => TaskOutcome::Finished(result),
        Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
        Err(e) if e.is_panic() => {
            TaskOutcome::Failed(TaskError::Panicked(panic_message(e.into_panic().as_ref())).to_string())
        }
        Err(_) => TaskOutcome::Failed(TaskError::Cancelled.to_string()),
    }
}
