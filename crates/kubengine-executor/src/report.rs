use kubengine_core_domain::{StepResult, StepStatus};
use serde::Serialize;

/// Terminal view of one (node, step) pair for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub node: String,
    pub step: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Why a pair was never attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

impl ReportEntry {
    pub fn from_result(result: &StepResult) -> Self {
        Self {
            node: result.node.clone(),
            step: result.step.clone(),
            status: result.status,
            attempt_count: result.attempt_count,
            exit_code: result.exit_code,
            error_detail: result.error_detail.clone(),
            blocked_by: None,
        }
    }

    pub fn skipped(previous: &StepResult) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::from_result(previous)
        }
    }

    pub fn pending(node: &str, step: &str, reason: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            step: step.to_string(),
            status: StepStatus::Pending,
            attempt_count: 0,
            exit_code: None,
            error_detail: None,
            blocked_by: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentReport {
    pub entries: Vec<ReportEntry>,
    /// Set when a critical master failure stopped the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub cancelled: bool,
}

impl DeploymentReport {
    /// Every applicable pair ended success or skipped, and nothing stopped the run early.
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.halted.is_none()
            && self.entries.iter().all(|entry| entry.status.is_done())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            2
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.status == StepStatus::Failed)
    }

    pub fn entry(&self, node: &str, step: &str) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|entry| entry.node == node && entry.step == step)
    }

    pub fn for_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a ReportEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.node == node)
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for entry in &self.entries {
            match entry.status {
                StepStatus::Success => summary.success += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Pending | StepStatus::Running => summary.pending += 1,
            }
        }
        summary
    }
}
