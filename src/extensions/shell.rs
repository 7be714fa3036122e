//! Built-in `shell` task: runs one program in the task's working directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::extensions::task::{Task, TaskError, TaskFactory, TaskHeader, TaskSpec};
use crate::worker::executor::ProcessExecutor;

pub const SHELL_TASK_TYPE: &str = "shell";
pub const SHELL_LOADER: &str = "builtin:shell";

/// Payload of a `shell` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Result payload of a successful `shell` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResult {
    pub exit_code: i32,
    pub log_dir: String,
}

#[derive(Debug)]
pub struct ShellTask {
    header: TaskHeader,
    command: ShellCommand,
}

impl ShellTask {
    pub fn command(&self) -> &ShellCommand {
        &self.command
    }
}

#[async_trait]
impl Task for ShellTask {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn exec(&self, executor: &ProcessExecutor) -> Result<Vec<u8>, TaskError> {
        let output = executor
            .execute(&self.command.program, &self.command.args)
            .await?;

        match output.exit_code {
            Some(exit_code) if output.success => Ok(serde_json::to_vec(&ShellResult {
                exit_code,
                log_dir: executor.working_dir().display().to_string(),
            })?),
            Some(exit_code) => Err(TaskError::Execution(format!(
                "{} exited with status {}",
                self.command.program, exit_code
            ))),
            None => Err(TaskError::Execution(format!(
                "{} terminated by signal",
                self.command.program
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct ShellTaskFactory;

impl TaskFactory for ShellTaskFactory {
    fn decode(&self, spec: TaskSpec) -> Result<Box<dyn Task>, TaskError> {
        let command: ShellCommand = serde_json::from_slice(&spec.payload)
            .map_err(|e| TaskError::decode(&spec.task_type, e))?;
        if command.program.trim().is_empty() {
            return Err(TaskError::decode(&spec.task_type, "program must not be empty"));
        }

        Ok(Box::new(ShellTask {
            header: spec.header(),
            command,
        }))
    }
}
