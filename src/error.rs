use thiserror::Error;

use crate::tls::TlsError;

/// Fatal worker errors. Any of these terminates the runtime.
///
/// Per-task problems (unknown task types, undecodable payloads, failing task
/// bodies) are [`TaskError`](crate::extensions::TaskError)s instead and never
/// reach this type.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker {0} already enrolled, use a new id or remove it from the manager")]
    AlreadyEnrolled(String),

    #[error("Enrollment failed with unexpected status {0}")]
    UnexpectedEnrollStatus(i32),

    #[error("Expected TASK_READY on the delivery stream, got status {0}")]
    UnexpectedTaskStatus(i32),

    #[error("Enroll stream closed by the manager")]
    StreamClosed,

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
