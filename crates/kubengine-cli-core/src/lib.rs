pub mod audit;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod render;
pub mod state;

use kubengine_core_domain::ClusterConfigError;
use kubengine_executor::ExecutionError;
use kubengine_storage::StorageError;
use thiserror::Error;

/// Process exit code for configuration and validation failures.
pub const EXIT_CONFIG: i32 = 1;
/// Process exit code for partial or total deployment failure.
pub const EXIT_DEPLOY_FAILED: i32 = 2;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cluster file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid cluster config: {0}")]
    Cluster(#[from] ClusterConfigError),
    #[error("{0}")]
    Execution(#[from] ExecutionError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("config error: {0}")]
    Config(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Execution(ExecutionError::Storage { .. }) => EXIT_DEPLOY_FAILED,
            _ => EXIT_CONFIG,
        }
    }

    /// Operator guidance printed after the error itself.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CliError::Execution(ExecutionError::StateCorruption { .. })
            | CliError::Storage(StorageError::Corrupted { .. }) => Some(
                "the deployment state file cannot be read; run `kubengine reset-state --force` and deploy again",
            ),
            _ => None,
        }
    }
}
