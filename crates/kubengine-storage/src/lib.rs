mod history;
mod lock;

pub use history::{HistoryOptions, ResultHistory};

use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kubengine_core_domain::{DeploymentState, ResetScope};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::lock::{FileLock, LockMode};

#[derive(Debug)]
pub enum StorageError {
    IoError { message: String },
    Corrupted { path: PathBuf, message: String },
    SerializeError { message: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::IoError { message } => write!(f, "io error: {}", message),
            StorageError::Corrupted { path, message } => {
                write!(f, "state file {} is corrupted: {}", path.display(), message)
            }
            StorageError::SerializeError { message } => write!(f, "serialize error: {}", message),
        }
    }
}

impl Error for StorageError {}

/// Wraps an io error with what was being attempted.
pub(crate) fn io_context(context: String) -> impl FnOnce(io::Error) -> StorageError {
    move |err| StorageError::IoError {
        message: format!("{context}: {err}"),
    }
}

/// Durable record of per-node per-step results.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<DeploymentState, StorageError>;
    fn save(&self, state: &DeploymentState) -> Result<(), StorageError>;
    /// Destructive. Returns how many (node, step) entries were removed.
    fn reset(&self, scope: &ResetScope) -> Result<usize, StorageError>;
}

/// One JSON document, replaced atomically on every save. Readers take a
/// shared lock on `.state.json.lock`, writers an exclusive one.
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub const FILE_NAME: &'static str = "state.json";

    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    fn lock(&self, mode: LockMode) -> Result<FileLock, StorageError> {
        FileLock::acquire(&self.dir.join(format!(".{}.lock", Self::FILE_NAME)), mode)
    }

    /// A missing or blank file is an empty state, anything unparseable is corruption.
    fn read_document(&self, path: &Path) -> Result<DeploymentState, StorageError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(DeploymentState::default()),
            Err(err) => return Err(io_context(format!("failed to read {}", path.display()))(err)),
        };
        if content.trim().is_empty() {
            return Ok(DeploymentState::default());
        }
        serde_json::from_str(&content).map_err(|err| StorageError::Corrupted {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Readers see either the previous document or the new one, never a mix.
    fn replace_document(&self, path: &Path, state: &DeploymentState) -> Result<(), StorageError> {
        let mut body = serde_json::to_vec_pretty(state).map_err(|err| StorageError::SerializeError {
            message: format!("failed to serialize deployment state: {err}"),
        })?;
        body.push(b'\n');

        let mut staged = NamedTempFile::new_in(&self.dir)
            .map_err(io_context(format!("failed to stage state in {}", self.dir.display())))?;
        staged
            .write_all(&body)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(io_context("failed to write staged state".to_string()))?;
        staged
            .persist(path)
            .map_err(|err| io_context(format!("failed to replace {}", path.display()))(err.error))?;
        debug!(path = %path.display(), entries = state.len(), "state saved");
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<DeploymentState, StorageError> {
        let _guard = self.lock(LockMode::Shared)?;
        self.read_document(&self.state_path())
    }

    fn save(&self, state: &DeploymentState) -> Result<(), StorageError> {
        let _guard = self.lock(LockMode::Exclusive)?;
        self.replace_document(&self.state_path(), state)
    }

    fn reset(&self, scope: &ResetScope) -> Result<usize, StorageError> {
        let _guard = self.lock(LockMode::Exclusive)?;
        let path = self.state_path();
        // A corrupted file can always be cleared; narrower scopes need a readable one.
        let mut state = match (self.read_document(&path), scope) {
            (Ok(state), _) => state,
            (Err(StorageError::Corrupted { .. }), ResetScope::All) => DeploymentState::default(),
            (Err(err), _) => return Err(err),
        };
        let removed = state.reset(scope);
        self.replace_document(&path, &state)?;
        Ok(removed)
    }
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryStateStore {
    state: Mutex<DeploymentState>,
}

impl InMemoryStateStore {
    pub fn new(state: DeploymentState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> DeploymentState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self) -> Result<DeploymentState, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &DeploymentState) -> Result<(), StorageError> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = state.clone();
        Ok(())
    }

    fn reset(&self, scope: &ResetScope) -> Result<usize, StorageError> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.reset(scope))
    }
}
