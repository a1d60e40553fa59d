use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Counts toward an overall successful run.
    pub fn is_done(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one (node, step) execution. `error_detail` is set iff failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub node: String,
    pub step: String,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub attempt_count: u32,
}

impl StepResult {
    pub fn running(node: &str, step: &str, attempt_count: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            node: node.to_string(),
            step: step.to_string(),
            status: StepStatus::Running,
            started_at: Some(started_at),
            finished_at: None,
            error_detail: None,
            exit_code: None,
            attempt_count,
        }
    }

    pub fn succeeded(mut self, finished_at: DateTime<Utc>, exit_code: Option<i32>) -> Self {
        self.status = StepStatus::Success;
        self.finished_at = Some(finished_at);
        self.error_detail = None;
        self.exit_code = exit_code;
        self
    }

    pub fn failed(
        mut self,
        finished_at: DateTime<Utc>,
        error_detail: String,
        exit_code: Option<i32>,
    ) -> Self {
        self.status = StepStatus::Failed;
        self.finished_at = Some(finished_at);
        self.error_detail = Some(error_detail);
        self.exit_code = exit_code;
        self
    }
}

/// Scope of a destructive state reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Node(String),
    NodeStep { node: String, step: String },
}

impl std::fmt::Display for ResetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetScope::All => f.write_str("all"),
            ResetScope::Node(node) => write!(f, "node {node}"),
            ResetScope::NodeStep { node, step } => write!(f, "step {step} on node {node}"),
        }
    }
}

/// Latest result per node address and step name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nodes: BTreeMap<String, BTreeMap<String, StepResult>>,
}

fn default_version() -> u32 {
    STATE_FORMAT_VERSION
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            config_fingerprint: None,
            updated_at: None,
            nodes: BTreeMap::new(),
        }
    }
}

impl DeploymentState {
    pub fn get(&self, node: &str, step: &str) -> Option<&StepResult> {
        self.nodes.get(node).and_then(|steps| steps.get(step))
    }

    pub fn is_success(&self, node: &str, step: &str) -> bool {
        self.get(node, step)
            .map(|result| result.status == StepStatus::Success)
            .unwrap_or(false)
    }

    /// Replaces the latest result for the result's (node, step).
    pub fn record(&mut self, result: StepResult) {
        self.nodes
            .entry(result.node.clone())
            .or_default()
            .insert(result.step.clone(), result);
    }

    /// Returns how many (node, step) entries were removed.
    pub fn reset(&mut self, scope: &ResetScope) -> usize {
        match scope {
            ResetScope::All => {
                let removed = self.len();
                self.nodes.clear();
                self.config_fingerprint = None;
                removed
            }
            ResetScope::Node(node) => self.nodes.remove(node).map(|steps| steps.len()).unwrap_or(0),
            ResetScope::NodeStep { node, step } => {
                let removed = self
                    .nodes
                    .get_mut(node)
                    .and_then(|steps| steps.remove(step))
                    .is_some();
                if self.nodes.get(node).map(BTreeMap::is_empty).unwrap_or(false) {
                    self.nodes.remove(node);
                }
                usize::from(removed)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
