use std::fs;
use std::path::{Path, PathBuf};

use kubengine_core_domain::{ClusterConfig, RawClusterConfig};
use kubengine_executor::StepRegistry;

use crate::CliError;

pub const CLUSTER_FILE: &str = "cluster.yaml";

/// Parsed cluster file together with its validated form and step plan.
pub struct LoadedCluster {
    pub path: PathBuf,
    pub raw: RawClusterConfig,
    pub config: ClusterConfig,
    pub registry: StepRegistry,
}

pub fn cluster_file_path(home: &Path, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(path) => path.to_path_buf(),
        None => home.join(CLUSTER_FILE),
    }
}

pub fn load_raw_cluster(path: &Path) -> Result<RawClusterConfig, CliError> {
    if !path.exists() {
        return Err(CliError::Config(format!(
            "cluster file {} not found; pass --config or create it",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Parses, validates and resolves the step plan. Nothing here touches the network.
pub fn load_cluster(path: &Path) -> Result<LoadedCluster, CliError> {
    let raw = load_raw_cluster(path)?;
    let config = raw.validate()?;
    let registry = StepRegistry::for_cluster(&raw.steps)?;
    registry.resolve()?;
    Ok(LoadedCluster {
        path: path.to_path_buf(),
        raw,
        config,
        registry,
    })
}

/// The bundle root is handed verbatim to remote shells, so it must be absolute.
pub fn validate_deploy_src(value: &str) -> Result<String, CliError> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() || !trimmed.starts_with('/') {
        return Err(CliError::InvalidInput(format!(
            "deploy source must be an absolute path, got {value:?}"
        )));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || "'\"`$;&|".contains(c)) {
        return Err(CliError::InvalidInput(format!(
            "deploy source contains characters unsafe for a remote shell: {value:?}"
        )));
    }
    Ok(trimmed.to_string())
}
