use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::extensions::ExtensionRegistry;
use crate::grpc::manager_client;
use crate::proto::EnrollRequest;
use crate::shutdown::StopSignal;
use crate::tls::TlsIdentity;
use crate::worker::{DeliveryHandler, EnrollmentState, ExecutionScheduler, StatusReporter};

/// Upper bound on how long `stop()` waits for the coordination loops to exit.
const LOOP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "created"),
            NodeState::Starting => write!(f, "starting"),
            NodeState::Running => write!(f, "running"),
            NodeState::Stopping => write!(f, "stopping"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A worker node: owns the manager channel and the background loops.
///
/// Lifecycle:
/// 1. [`start`](Self::start) connects, sends the enroll request and spawns the
///    enroll stream handler
/// 2. Once the manager accepts the enrollment, the handler launches the
///    status reporter and the execution scheduler
/// 3. [`wait_for_termination`](Self::wait_for_termination) resolves when any
///    loop hits a fatal condition
/// 4. [`stop`](Self::stop) closes the channel and cancels everything still
///    running
pub struct WorkerNode {
    config: WorkerConfig,
    registry: Arc<ExtensionRegistry>,
    tls_identity: Option<TlsIdentity>,
    state: NodeState,
    channel: Option<Channel>,
    stop: StopSignal,
    /// Cancels the coordination loops
    cancel: CancellationToken,
    /// Cancels in-flight task executions
    execution_cancel: CancellationToken,
    loops: TaskTracker,
    executions: TaskTracker,
    capacity: Arc<Semaphore>,
    enrollment_tx: watch::Sender<EnrollmentState>,
    enrollment_rx: watch::Receiver<EnrollmentState>,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig, registry: Arc<ExtensionRegistry>) -> Self {
        let (enrollment_tx, enrollment_rx) = watch::channel(EnrollmentState::Unenrolled);
        let capacity = Arc::new(Semaphore::new(config.identity.max_tasks as usize));

        Self {
            config,
            registry,
            tls_identity: None,
            state: NodeState::Created,
            channel: None,
            stop: StopSignal::new(),
            cancel: CancellationToken::new(),
            execution_cancel: CancellationToken::new(),
            loops: TaskTracker::new(),
            executions: TaskTracker::new(),
            capacity,
            enrollment_tx,
            enrollment_rx,
        }
    }

    pub fn with_tls_identity(mut self, tls_identity: Option<TlsIdentity>) -> Self {
        self.tls_identity = tls_identity;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.identity.worker_id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn enrollment_state(&self) -> EnrollmentState {
        *self.enrollment_rx.borrow()
    }

    /// Subscribe to enrollment state changes.
    pub fn enrollment_updates(&self) -> watch::Receiver<EnrollmentState> {
        self.enrollment_rx.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Task executions currently running.
    pub fn in_flight_tasks(&self) -> usize {
        self.executions.len()
    }

    /// Free capacity permits. The idle scheduler parks one permit while it
    /// waits for the next delivery, so this reads `max_tasks - 1` with no
    /// task running and `max_tasks` only once the node has stopped.
    pub fn available_permits(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Coordination loops (stream handler, reporter, scheduler) still alive.
    pub fn running_loops(&self) -> usize {
        self.loops.len()
    }

    /// Connect to the manager, enroll, and start consuming task deliveries.
    ///
    /// Returns once the enroll stream is open; the outcome of the enrollment
    /// itself is observed through [`enrollment_state`](Self::enrollment_state)
    /// and [`wait_for_termination`](Self::wait_for_termination).
    ///
    /// # Errors
    ///
    /// Fails if the node was already started or its configuration is
    /// invalid, leaving it in [`NodeState::Created`] without contacting the
    /// manager. Also fails if the manager cannot be reached or refuses the
    /// enroll call; the stop signal is set in that case.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != NodeState::Created {
            return Err(WorkerError::InvalidState(format!(
                "cannot start worker in state {}",
                self.state
            )));
        }
        self.config.validate()?;
        self.state = NodeState::Starting;

        let identity = self.config.identity.clone();
        tracing::info!(worker_id = %identity.worker_id, "Starting worker");

        let (channel, mut client) =
            match manager_client(&self.config.manager_addr, self.tls_identity.as_ref()).await {
                Ok(connected) => connected,
                Err(e) => {
                    self.stop.trigger();
                    return Err(e);
                }
            };

        tracing::info!(worker_id = %identity.worker_id, "Sending enroll request to cluster manager");
        let responses = match client.enroll(EnrollRequest::from(&identity)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                self.enrollment_tx.send_replace(EnrollmentState::Failed);
                self.stop.trigger();
                return Err(WorkerError::GrpcError(status));
            }
        };
        self.channel = Some(channel);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let reporter = StatusReporter::new(
            identity.worker_id.clone(),
            self.config.heartbeat_interval(),
            client,
            status_rx,
            self.stop.clone(),
            self.cancel.clone(),
        );
        let scheduler = ExecutionScheduler::new(
            inbound_rx,
            status_tx,
            self.capacity.clone(),
            self.config.logs_dir.clone(),
        )
        .with_executions(self.executions.clone())
        .with_cancellation(self.cancel.clone(), self.execution_cancel.clone());

        let loops = self.loops.clone();
        let worker_id = identity.worker_id.clone();
        let launch = move || {
            tracing::info!(worker_id = %worker_id, "Starting heartbeat loop");
            loops.spawn(reporter.run());
            tracing::info!(worker_id = %worker_id, "Starting task execute loop");
            loops.spawn(scheduler.run());
        };

        let handler = DeliveryHandler::new(
            identity.worker_id.clone(),
            self.registry.clone(),
            inbound_tx,
            self.enrollment_tx.clone(),
            self.stop.clone(),
            self.cancel.clone(),
        );
        self.loops.spawn(handler.run(responses, launch));

        self.state = NodeState::Running;
        Ok(())
    }

    /// Block until the stop signal is set. Safe to call in any state.
    ///
    /// Returns the fatal error that stopped the worker, if there was one.
    pub async fn wait_for_termination(&self) -> Option<Arc<WorkerError>> {
        let cause = self.stop.wait().await;
        tracing::info!(worker_id = %self.worker_id(), "Stop event set, stopping worker");
        cause
    }

    /// Close the manager channel and cancel all background work.
    ///
    /// Coordination loops are cancelled and given a bounded grace period to
    /// exit. In-flight task executions are cancelled but not awaited; their
    /// outcomes are not reported.
    pub async fn stop(&mut self) {
        if self.state == NodeState::Stopped {
            return;
        }
        self.state = NodeState::Stopping;
        self.stop.trigger();

        if self.channel.take().is_some() {
            tracing::info!(worker_id = %self.worker_id(), "Closing channel to cluster manager");
        }

        let unfinished = self.loops.len();
        tracing::info!(worker_id = %self.worker_id(), unfinished, "Canceling unfinished background loops");
        self.cancel.cancel();
        self.loops.close();
        if tokio::time::timeout(LOOP_SHUTDOWN_GRACE, self.loops.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id = %self.worker_id(),
                remaining = self.loops.len(),
                "Background loops did not exit within grace period"
            );
        } else {
            tracing::info!(worker_id = %self.worker_id(), "All unfinished background loops canceled");
        }

        let in_flight = self.executions.len();
        if in_flight > 0 {
            tracing::warn!(worker_id = %self.worker_id(), in_flight, "Abandoning in-flight task executions");
        }
        self.execution_cancel.cancel();
        self.executions.close();

        self.state = NodeState::Stopped;
    }
}
