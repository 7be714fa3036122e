
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use cluster_worker::extensions::Task;
use cluster_worker::worker::{ExecutionScheduler, StatusUpdate, TaskOutcome};
use test_harness::{gauged_task, wait_until, TaskGauge};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    inbound: mpsc::UnboundedSender<Box<dyn Task>>,
    status: mpsc::UnboundedReceiver<StatusUpdate>,
    capacity: Arc<Semaphore>,
    cancel: CancellationToken,
    execution_cancel: CancellationToken,
    gauge: Arc<TaskGauge>,
    scheduler: tokio::task::JoinHandle<()>,
    _logs: TempDir,
}

fn spawn_scheduler(max_tasks: usize) -> Fixture {
    let logs = TempDir::new().unwrap();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let capacity = Arc::new(Semaphore::new(max_tasks));
    let cancel = CancellationToken::new();
    let execution_cancel = CancellationToken::new();

    let scheduler = ExecutionScheduler::new(inbound_rx, status_tx, capacity.clone(), logs.path())
        .with_cancellation(cancel.clone(), execution_cancel.clone());

    Fixture {
        inbound: inbound_tx,
        status: status_rx,
        capacity,
        cancel,
        execution_cancel,
        gauge: Arc::new(TaskGauge::default()),
        scheduler: tokio::spawn(scheduler.run()),
        _logs: logs,
    }
}

impl Fixture {
    fn submit(&self, task_id: &str, payload: &str) {
        self.inbound
            .send(gauged_task(&self.gauge, task_id, payload))
            .unwrap();
    }

    async fn next_outcome(&mut self) -> (String, TaskOutcome) {
        let update = tokio::time::timeout(WAIT, self.status.recv())
            .await
            .expect("outcome in time")
            .expect("status queue open");
        match update {
            StatusUpdate::TaskOutcomeReport {
                task_id, outcome, ..
            } => (task_id, outcome),
            StatusUpdate::Heartbeat => panic!("scheduler never enqueues heartbeats"),
        }
    }
}

#[tokio::test]
async fn test_in_flight_tasks_bounded_by_capacity() {
    let mut fx = spawn_scheduler(2);
    for i in 0..5 {
        fx.submit(&format!("t{}", i), "100");
    }

    for _ in 0..5 {
        let (_, outcome) = fx.next_outcome().await;
        assert!(matches!(outcome, TaskOutcome::Finished(_)));
    }

    assert_eq!(fx.gauge.started(), 5);
    assert_eq!(fx.gauge.max_running(), 2);
    // The idle loop holds one permit while waiting for the next task.
    assert!(wait_until(|| fx.capacity.available_permits() == 1, WAIT).await);

    fx.cancel.cancel();
    tokio::time::timeout(WAIT, &mut fx.scheduler)
        .await
        .expect("scheduler exits on cancel")
        .unwrap();
    assert!(wait_until(|| fx.capacity.available_permits() == 2, WAIT).await);
}

#[tokio::test]
async fn test_single_permit_executes_in_fifo_order() {
    let mut fx = spawn_scheduler(1);
    for task_id in ["first", "second", "third"] {
        fx.submit(task_id, "10");
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(fx.next_outcome().await.0);
    }
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_failure_and_panic_each_produce_one_failed_outcome() {
    let mut fx = spawn_scheduler(1);
    fx.submit("fails", "fail");
    fx.submit("panics", "panic");
    fx.submit("after", "0");

    let (task_id, outcome) = fx.next_outcome().await;
    assert_eq!(task_id, "fails");
    assert_eq!(outcome, TaskOutcome::Failed("gauged failure".to_string()));

    let (task_id, outcome) = fx.next_outcome().await;
    assert_eq!(task_id, "panics");
    assert!(matches!(outcome, TaskOutcome::Failed(ref e) if e.contains("gauged panic")));

    let (task_id, outcome) = fx.next_outcome().await;
    assert_eq!(task_id, "after");
    assert_eq!(outcome, TaskOutcome::Finished(b"slept 0".to_vec()));

    assert!(fx.status.try_recv().is_err());

    fx.cancel.cancel();
    tokio::time::timeout(WAIT, &mut fx.scheduler)
        .await
        .expect("scheduler exits on cancel")
        .unwrap();
    assert!(wait_until(|| fx.capacity.available_permits() == 1, WAIT).await);
}

#[tokio::test]
async fn test_waiting_tasks_stay_queued_while_capacity_is_exhausted() {
    let fx = spawn_scheduler(1);
    fx.submit("slow", "400");
    fx.submit("queued", "0");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fx.gauge.started(), 1);
    assert_eq!(fx.capacity.available_permits(), 0);

    assert!(wait_until(|| fx.gauge.started() == 2, WAIT).await);
}

#[tokio::test]
async fn test_cancel_stops_admission_but_not_running_tasks() {
    let mut fx = spawn_scheduler(1);
    fx.submit("running", "200");
    assert!(wait_until(|| fx.gauge.started() == 1, WAIT).await);

    fx.cancel.cancel();
    tokio::time::timeout(WAIT, &mut fx.scheduler)
        .await
        .expect("scheduler exits on cancel")
        .unwrap();

    // The loop owned the receiving end.
    assert!(fx
        .inbound
        .send(gauged_task(&fx.gauge, "never", "0"))
        .is_err());
    let (task_id, outcome) = fx.next_outcome().await;
    assert_eq!(task_id, "running");
    assert!(matches!(outcome, TaskOutcome::Finished(_)));
    assert_eq!(fx.gauge.started(), 1);
}

#[tokio::test]
async fn test_execution_cancel_releases_permit_without_outcome() {
    let mut fx = spawn_scheduler(1);
    fx.submit("long", "10000");
    assert!(wait_until(|| fx.gauge.started() == 1, WAIT).await);
    assert_eq!(fx.capacity.available_permits(), 0);

    fx.cancel.cancel();
    fx.execution_cancel.cancel();

    assert!(wait_until(|| fx.capacity.available_permits() == 1, WAIT).await);
    assert!(tokio::time::timeout(Duration::from_millis(200), fx.status.recv())
        .await
        .map_or(true, |update| update.is_none()));
}

#[tokio::test]
async fn test_closed_inbound_queue_ends_loop() {
    let mut fx = spawn_scheduler(2);
    let (closed_tx, _) = mpsc::unbounded_channel::<Box<dyn Task>>();
    fx.inbound = closed_tx;

    tokio::time::timeout(WAIT, &mut fx.scheduler)
        .await
        .expect("scheduler exits when queue closes")
        .unwrap();
}
