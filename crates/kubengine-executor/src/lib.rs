pub mod actions;
mod orchestrator;
mod registry;
mod report;

pub use actions::{ActionError, CommandRunner, StepAction, StepContext};
pub use orchestrator::{
    CancellationToken, DeployOptions, Orchestrator, ProgressCallback, SshCredentials,
};
pub use registry::{Step, StepRegistry};
pub use report::{DeploymentReport, ReportEntry, ReportSummary};

use kubengine_storage::StorageError;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Rejected before any remote call.
    Config { message: String },
    /// Persisted state cannot be parsed; only a reset recovers.
    StateCorruption { path: PathBuf, message: String },
    Storage { message: String },
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Config { message } => write!(f, "ConfigError: {message}"),
            ExecutionError::StateCorruption { path, message } => write!(
                f,
                "state corruption in {}: {message}",
                path.display()
            ),
            ExecutionError::Storage { message } => write!(f, "storage error: {message}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupted { path, message } => {
                ExecutionError::StateCorruption { path, message }
            }
            other => ExecutionError::Storage {
                message: other.to_string(),
            },
        }
    }
}
