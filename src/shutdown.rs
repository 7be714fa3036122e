use std::sync::{Arc, OnceLock};

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;

/// Process-wide, set-once stop event.
///
/// Any fatal condition trips it; once set it is never cleared. The first
/// recorded cause wins, later ones are only logged.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    cause: Arc<OnceLock<Arc<WorkerError>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal cause and set the signal.
    pub fn set(&self, cause: WorkerError) {
        tracing::error!(error = %cause, "Fatal worker error, stop signal set");
        // Cause must be visible before waiters wake up.
        let _ = self.cause.set(Arc::new(cause));
        self.token.cancel();
    }

    /// Set the signal without a fatal cause (operator shutdown, `stop()`).
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<Arc<WorkerError>> {
        self.cause.get().cloned()
    }

    /// Wait until the signal is set. Returns immediately if it already is.
    pub async fn wait(&self) -> Option<Arc<WorkerError>> {
        self.token.cancelled().await;
        self.cause()
    }
}

/// Trip `stop` when SIGTERM or SIGINT is received.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub fn install_shutdown_handler(stop: StopSignal) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping worker");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping worker");
            }
            _ = stop.wait() => return,
        }

        stop.trigger();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_cause_wins_and_signal_stays_set() {
        let stop = StopSignal::new();
        assert!(!stop.is_set());

        stop.set(WorkerError::StreamClosed);
        stop.set(WorkerError::UnexpectedTaskStatus(7));

        assert!(stop.is_set());
        let cause = stop.wait().await.expect("cause recorded");
        assert!(matches!(*cause, WorkerError::StreamClosed));
    }

    #[tokio::test]
    async fn wait_is_level_triggered() {
        let stop = StopSignal::new();
        stop.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), stop.wait()).await;
        assert!(matches!(result, Ok(None)));
        // A second waiter after the fact returns as well.
        assert!(tokio::time::timeout(Duration::from_millis(100), stop.wait())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        stop.set(WorkerError::UnexpectedEnrollStatus(0));
        let cause = handle.await.unwrap().expect("cause recorded");
        assert!(matches!(*cause, WorkerError::UnexpectedEnrollStatus(0)));
    }
}
