use async_trait::async_trait;
use thiserror::Error;

use crate::proto;
use crate::worker::executor::ProcessExecutor;

/// Recoverable and task-local failures.
///
/// Raised while decoding a delivered task (logged, the delivery is skipped)
/// or while executing one (reported to the manager as `TASK_EXCEPTION`).
/// Never terminates the worker.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task type {0} not found")]
    UnknownTaskType(String),

    #[error("failed to decode {task_type} task: {reason}")]
    Decode { task_type: String, reason: String },

    #[error("extension error: {0}")]
    Extension(String),

    #[error("invalid job or task id: {0:?}")]
    InvalidId(String),

    #[error("{0}")]
    Execution(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TaskError {
    pub fn decode(task_type: &str, reason: impl ToString) -> Self {
        TaskError::Decode {
            task_type: task_type.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Identity of one delivered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHeader {
    pub job_id: String,
    pub task_id: String,
    pub task_type: String,
}

/// A task as delivered on the wire, before its type-specific decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub job_id: String,
    pub task_id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
}

impl TaskSpec {
    pub fn new(
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }

    pub fn header(&self) -> TaskHeader {
        TaskHeader {
            job_id: self.job_id.clone(),
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
        }
    }
}

impl From<proto::TaskSpec> for TaskSpec {
    fn from(spec: proto::TaskSpec) -> Self {
        Self {
            job_id: spec.job_id,
            task_id: spec.task_id,
            task_type: spec.task_type,
            payload: spec.payload,
        }
    }
}

impl From<TaskSpec> for proto::TaskSpec {
    fn from(spec: TaskSpec) -> Self {
        proto::TaskSpec {
            job_id: spec.job_id,
            task_id: spec.task_id,
            task_type: spec.task_type,
            payload: spec.payload,
        }
    }
}

/// One unit of assigned work.
#[async_trait]
pub trait Task: Send + Sync {
    fn header(&self) -> &TaskHeader;

    /// Run the task, returning its result payload.
    async fn exec(&self, executor: &ProcessExecutor) -> Result<Vec<u8>, TaskError>;
}

/// Builds tasks of one type from their wire form.
pub trait TaskFactory: Send + Sync {
    fn decode(&self, spec: TaskSpec) -> Result<Box<dyn Task>, TaskError>;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Task").field(self.header()).finish()
    }
}
