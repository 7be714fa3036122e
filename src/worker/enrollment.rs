use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::WorkerError;
use crate::extensions::{ExtensionRegistry, Task, TaskError, TaskSpec};
use crate::proto::{EnrollResponse, EnrollStatus};
use crate::shutdown::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Unenrolled,
    Enrolling,
    Enrolled,
    Rejected,
    Failed,
}

impl std::fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentState::Unenrolled => write!(f, "unenrolled"),
            EnrollmentState::Enrolling => write!(f, "enrolling"),
            EnrollmentState::Enrolled => write!(f, "enrolled"),
            EnrollmentState::Rejected => write!(f, "rejected"),
            EnrollmentState::Failed => write!(f, "failed"),
        }
    }
}

/// Consumer of the enroll response stream.
///
/// The first response settles the enrollment; every later one must deliver a
/// task, which is decoded through the registry and queued for execution in
/// arrival order. Protocol violations and link loss trip the stop signal;
/// a task that cannot be decoded is logged and skipped.
pub struct DeliveryHandler {
    worker_id: String,
    registry: Arc<ExtensionRegistry>,
    inbound: mpsc::UnboundedSender<Box<dyn Task>>,
    state: watch::Sender<EnrollmentState>,
    stop: StopSignal,
    cancel: CancellationToken,
}

impl DeliveryHandler {
    pub fn new(
        worker_id: impl Into<String>,
        registry: Arc<ExtensionRegistry>,
        inbound: mpsc::UnboundedSender<Box<dyn Task>>,
        state: watch::Sender<EnrollmentState>,
        stop: StopSignal,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            registry,
            inbound,
            state,
            stop,
            cancel,
        }
    }

    /// Consume `responses` until cancellation or a fatal condition.
    ///
    /// `on_enrolled` runs once, right after a successful enrollment and before
    /// the first delivery is processed.
    pub async fn run<S, F>(self, mut responses: S, on_enrolled: F)
    where
        S: Stream<Item = Result<EnrollResponse, Status>> + Unpin,
        F: FnOnce(),
    {
        self.state.send_replace(EnrollmentState::Enrolling);

        let first = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(worker_id = %self.worker_id, "Enroll stream handler cancelled");
                return;
            }
            first = responses.next() => first,
        };

        if let Err(e) = self.accept_enrollment(first) {
            self.stop.set(e);
            return;
        }
        on_enrolled();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(worker_id = %self.worker_id, "Enroll stream handler cancelled");
                    return;
                }
                next = responses.next() => next,
            };

            let fatal = match next {
                Some(Ok(response)) => match self.handle_delivery(response).await {
                    Ok(()) => continue,
                    Err(e) => e,
                },
                Some(Err(status)) => {
                    tracing::error!(
                        worker_id = %self.worker_id,
                        error = %status,
                        "gRPC error: can't connect with cluster manager"
                    );
                    WorkerError::GrpcError(status)
                }
                None => WorkerError::StreamClosed,
            };
            self.stop.set(fatal);
            return;
        }
    }

    fn accept_enrollment(
        &self,
        first: Option<Result<EnrollResponse, Status>>,
    ) -> Result<(), WorkerError> {
        let response = match first {
            Some(Ok(response)) => response,
            Some(Err(status)) => {
                self.state.send_replace(EnrollmentState::Failed);
                return Err(WorkerError::GrpcError(status));
            }
            None => {
                self.state.send_replace(EnrollmentState::Failed);
                return Err(WorkerError::StreamClosed);
            }
        };

        match EnrollStatus::try_from(response.status) {
            Ok(EnrollStatus::EnrollSuccess) => {
                self.state.send_replace(EnrollmentState::Enrolled);
                tracing::info!(worker_id = %self.worker_id, "Successfully enrolled to cluster manager");
                Ok(())
            }
            Ok(EnrollStatus::AlreadyEnrolled) => {
                self.state.send_replace(EnrollmentState::Rejected);
                Err(WorkerError::AlreadyEnrolled(self.worker_id.clone()))
            }
            _ => {
                self.state.send_replace(EnrollmentState::Failed);
                Err(WorkerError::UnexpectedEnrollStatus(response.status))
            }
        }
    }

    /// Queue the task carried by one delivery.
    ///
    /// Only a wrong status is fatal; decode problems are logged and skipped.
    async fn handle_delivery(&self, response: EnrollResponse) -> Result<(), WorkerError> {
        if response.status != EnrollStatus::TaskReady as i32 {
            return Err(WorkerError::UnexpectedTaskStatus(response.status));
        }
        tracing::trace!(response = ?response, "Delivery received");

        let task = match response.task {
            Some(spec) => self.registry.decode(TaskSpec::from(spec)).await,
            None => Err(TaskError::decode("", "delivery carries no task")),
        };

        match task {
            Ok(task) => {
                let header = task.header().clone();
                if self.inbound.send(task).is_err() {
                    tracing::warn!(
                        job_id = %header.job_id,
                        task_id = %header.task_id,
                        "Inbound task queue closed, task dropped"
                    );
                } else {
                    tracing::trace!(job_id = %header.job_id, task_id = %header.task_id, "Put task in queue");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Preprocess fetched task failed");
            }
        }
        Ok(())
    }
}
