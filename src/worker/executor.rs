use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use tokio::fs;
use tokio::process::Command;

use crate::extensions::TaskError;

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Exit information of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Runs external processes on behalf of a single task.
///
/// Each executor owns one working directory, `<logs_dir>/jobs/<job_id>/<task_id>`.
/// Processes run with that directory as their cwd and their stdout/stderr are
/// captured into [`STDOUT_LOG`] and [`STDERR_LOG`] inside it, so executions of
/// different tasks never share working state.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    working_dir: PathBuf,
}

impl ProcessExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Executor scoped to one job/task under `logs_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidId`] if either id is not a single plain
    /// path component.
    pub fn for_task(logs_dir: &Path, job_id: &str, task_id: &str) -> Result<Self, TaskError> {
        ensure_path_component(job_id)?;
        ensure_path_component(task_id)?;
        Ok(Self::new(logs_dir.join("jobs").join(job_id).join(task_id)))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run `program` with `args` to completion.
    ///
    /// A non-zero exit is not an error here; callers decide what it means.
    pub async fn execute(&self, program: &str, args: &[String]) -> Result<ProcessOutput, TaskError> {
        fs::create_dir_all(&self.working_dir).await?;
        let stdout = fs::File::create(self.working_dir.join(STDOUT_LOG))
            .await?
            .into_std()
            .await;
        let stderr = fs::File::create(self.working_dir.join(STDERR_LOG))
            .await?
            .into_std()
            .await;

        tracing::info!(
            program,
            args = ?args,
            working_dir = %self.working_dir.display(),
            "Spawning task process"
        );

        let status = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| TaskError::Execution(format!("failed to spawn {}: {}", program, e)))?;

        let output = ProcessOutput {
            exit_code: status.code(),
            success: status.success(),
        };

        tracing::info!(
            program,
            exit_code = ?output.exit_code,
            success = output.success,
            "Task process exited"
        );

        Ok(output)
    }
}

fn ensure_path_component(id: &str) -> Result<(), TaskError> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TaskError::InvalidId(id.to_string())),
    }
}
