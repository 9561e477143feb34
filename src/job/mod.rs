//! Supervision of the single job an agent runs at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::AgentSettings;
use crate::protocol::TrainRequest;

mod process;
mod supervisor;

pub use process::{ExitReport, JobProcess};
pub use supervisor::JobSupervisor;

/// Lifecycle of a job. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A training run dispatched by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub training_id: String,
    /// Working directory of the job process.
    pub folder_path: PathBuf,
    pub script_path: PathBuf,
    /// Program the script is handed to, e.g. `python3`.
    pub interpreter_command: String,
    pub state: JobState,
}

impl Job {
    /// Builds a pending job, filling in defaults for fields the request omits.
    pub fn from_request(request: &TrainRequest, settings: &JobSettings) -> Self {
        let script = request
            .script_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&settings.default_script);
        let interpreter = request
            .python_command
            .as_deref()
            .filter(|cmd| !cmd.trim().is_empty())
            .unwrap_or(&settings.default_interpreter);
        Self {
            training_id: request.training_id.clone(),
            folder_path: request.folder_path.clone(),
            script_path: request.folder_path.join(script),
            interpreter_command: interpreter.to_string(),
            state: JobState::Pending,
        }
    }
}

/// Knobs of job execution, taken from [`AgentSettings`].
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub default_script: String,
    pub default_interpreter: String,
    /// Time a stopped job gets between SIGTERM and a forced kill.
    pub stop_grace: Duration,
    pub stderr_limit: usize,
    pub env: BTreeMap<String, String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        JobSettings::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for JobSettings {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            default_script: settings.default_script.clone(),
            default_interpreter: settings.default_interpreter.clone(),
            stop_grace: settings.stop_grace(),
            stderr_limit: settings.stderr_limit_bytes,
            env: settings.env.clone(),
        }
    }
}
