use std::path::{Path, PathBuf};

use kubengine_core_domain::ResetScope;
use kubengine_storage::{JsonFileStateStore, ResultHistory, StateStore};

use crate::CliError;

pub const STATE_DIR: &str = "state";

pub fn state_dir(home: &Path) -> PathBuf {
    home.join(STATE_DIR)
}

pub fn open_state_store(home: &Path) -> JsonFileStateStore {
    JsonFileStateStore::new(state_dir(home))
}

pub fn open_history(home: &Path) -> ResultHistory {
    ResultHistory::new(state_dir(home))
}

/// Maps the `reset-state` flags onto a scope. `--step` only makes sense with `--node`.
pub fn reset_scope(node: Option<&str>, step: Option<&str>) -> Result<ResetScope, CliError> {
    match (node, step) {
        (None, None) => Ok(ResetScope::All),
        (Some(node), None) => Ok(ResetScope::Node(node.trim().to_string())),
        (Some(node), Some(step)) => Ok(ResetScope::NodeStep {
            node: node.trim().to_string(),
            step: step.trim().to_string(),
        }),
        (None, Some(_)) => Err(CliError::InvalidInput(
            "--step requires --node".to_string(),
        )),
    }
}

/// Clears recorded progress. The history journal is left untouched.
pub fn reset_state(home: &Path, scope: &ResetScope) -> Result<usize, CliError> {
    let store = open_state_store(home);
    let removed = store.reset(scope)?;
    tracing::info!(scope = %scope, removed, "deployment state reset");
    Ok(removed)
}
