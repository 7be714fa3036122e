//! Worker runtime components.
//!
//! Three activities share one manager connection:
//! - **Delivery**: [`DeliveryHandler`] consumes the enroll stream, settles
//!   enrollment and queues decoded tasks
//! - **Execution**: [`ExecutionScheduler`] admits queued tasks under the
//!   capacity semaphore and runs each one against its own [`ProcessExecutor`]
//! - **Reporting**: [`StatusReporter`] sends task outcomes, or heartbeats
//!   when there is nothing to report
//!
//! [`WorkerNode`](crate::node::WorkerNode) wires them together.
//!
//! # Data Flow
//!
//! ```text
//! manager --enroll stream--> DeliveryHandler --inbound queue--> ExecutionScheduler
//!                                                                     |
//! manager <--UpdateTaskStatus-- StatusReporter <--status queue-- task executions
//! ```

pub mod enrollment;
pub mod executor;
pub mod scheduler;
pub mod status;

pub use enrollment::{DeliveryHandler, EnrollmentState};
pub use executor::ProcessExecutor;
pub use scheduler::ExecutionScheduler;
pub use status::{StatusReporter, StatusUpdate, TaskOutcome};
