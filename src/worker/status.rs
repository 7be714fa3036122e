use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::error::WorkerError;
use crate::extensions::TaskHeader;
use crate::proto::cluster_manager_client::ClusterManagerClient;
use crate::proto::{TaskStatus, UpdateStatus, UpdateStatusRequest};
use crate::shutdown::StopSignal;

/// Result of one task execution. Produced exactly once per executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(Vec<u8>),
    Failed(String),
}

/// Item of the outbound status queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Heartbeat,
    TaskOutcomeReport {
        job_id: String,
        task_id: String,
        outcome: TaskOutcome,
    },
}

impl StatusUpdate {
    pub fn report(header: &TaskHeader, outcome: TaskOutcome) -> Self {
        StatusUpdate::TaskOutcomeReport {
            job_id: header.job_id.clone(),
            task_id: header.task_id.clone(),
            outcome,
        }
    }

    pub fn into_request(self, worker_id: &str) -> UpdateStatusRequest {
        let mut request = UpdateStatusRequest {
            worker_id: worker_id.to_string(),
            ..Default::default()
        };

        if let StatusUpdate::TaskOutcomeReport {
            job_id,
            task_id,
            outcome,
        } = self
        {
            request.job_id = job_id;
            request.task_id = task_id;
            match outcome {
                TaskOutcome::Finished(result) => {
                    request.set_task_status(TaskStatus::TaskFinish);
                    request.exec_result = result;
                }
                TaskOutcome::Failed(error) => {
                    request.set_task_status(TaskStatus::TaskException);
                    request.exception = error;
                }
            }
        }

        request
    }
}

/// Drains the status queue onto the manager's `UpdateTaskStatus` RPC.
///
/// One RPC per tick: the next queued update if one arrives within the
/// heartbeat interval, a heartbeat otherwise. Updates go out in enqueue order
/// and heartbeats are only sent while the queue is empty.
pub struct StatusReporter {
    worker_id: String,
    interval: Duration,
    client: ClusterManagerClient<Channel>,
    updates: mpsc::UnboundedReceiver<StatusUpdate>,
    stop: StopSignal,
    cancel: CancellationToken,
}

impl StatusReporter {
    pub fn new(
        worker_id: impl Into<String>,
        interval: Duration,
        client: ClusterManagerClient<Channel>,
        updates: mpsc::UnboundedReceiver<StatusUpdate>,
        stop: StopSignal,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            interval,
            client,
            updates,
            stop,
            cancel,
        }
    }

    pub async fn run(self) {
        let Self {
            worker_id,
            interval,
            mut client,
            mut updates,
            stop,
            cancel,
        } = self;

        tracing::debug!(worker_id = %worker_id, interval_ms = interval.as_millis() as u64, "Status reporter started");

        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(worker_id = %worker_id, "Status reporter cancelled");
                    return;
                }
                next = timeout(interval, updates.recv()) => match next {
                    Ok(Some(update)) => update,
                    Ok(None) => {
                        tracing::debug!(worker_id = %worker_id, "Status queue closed, reporter exiting");
                        return;
                    }
                    Err(_) => {
                        tracing::trace!("No task status within interval, sending heartbeat");
                        StatusUpdate::Heartbeat
                    }
                },
            };

            let request = update.into_request(&worker_id);
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(worker_id = %worker_id, "Status reporter cancelled during RPC");
                    return;
                }
                response = client.update_task_status(request) => response,
            };

            match response {
                Ok(response) => {
                    let status = response.into_inner().status;
                    if status != UpdateStatus::Success as i32 {
                        tracing::warn!(
                            worker_id = %worker_id,
                            status,
                            "Update status failed, please check manager status"
                        );
                    }
                }
                Err(status) => {
                    tracing::error!(worker_id = %worker_id, error = %status, "Can't send status to manager");
                    stop.set(WorkerError::GrpcError(status));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TaskHeader {
        TaskHeader {
            job_id: "job-1".to_string(),
            task_id: "task-2".to_string(),
            task_type: "shell".to_string(),
        }
    }

    #[test]
    fn heartbeat_carries_only_worker_id() {
        let request = StatusUpdate::Heartbeat.into_request("worker-1");
        assert_eq!(
            request,
            UpdateStatusRequest {
                worker_id: "worker-1".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(request.task_status(), TaskStatus::Unspecified);
    }

    #[test]
    fn finished_report_carries_result() {
        let request = StatusUpdate::report(&header(), TaskOutcome::Finished(b"done".to_vec()))
            .into_request("worker-1");
        assert_eq!(request.worker_id, "worker-1");
        assert_eq!(request.job_id, "job-1");
        assert_eq!(request.task_id, "task-2");
        assert_eq!(request.task_status(), TaskStatus::TaskFinish);
        assert_eq!(request.exec_result, b"done".to_vec());
        assert!(request.exception.is_empty());
    }

    #[test]
    fn failed_report_carries_error_text() {
        let request = StatusUpdate::report(&header(), TaskOutcome::Failed("boom".to_string()))
            .into_request("worker-1");
        assert_eq!(request.task_status(), TaskStatus::TaskException);
        assert_eq!(request.exception, "boom");
        assert!(request.exec_result.is_empty());
    }
}
