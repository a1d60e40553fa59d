mod cluster;
mod state;

pub use cluster::{
    ClusterConfig, ClusterConfigError, LbRange, RawCidr, RawClusterConfig, RawLoadBalancer,
    RawNode, StepSpec,
};
pub use state::{DeploymentState, ResetScope, StepResult, StepStatus, STATE_FORMAT_VERSION};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which node roles a step targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleFilter {
    Master,
    Worker,
    Any,
}

impl RoleFilter {
    pub fn matches(self, role: Role) -> bool {
        match self {
            RoleFilter::Any => true,
            RoleFilter::Master => role == Role::Master,
            RoleFilter::Worker => role == Role::Worker,
        }
    }
}

impl std::fmt::Display for RoleFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleFilter::Master => f.write_str("master"),
            RoleFilter::Worker => f.write_str("worker"),
            RoleFilter::Any => f.write_str("any"),
        }
    }
}

/// A target machine. Identity is the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: String,
    pub hostname: String,
    pub role: Role,
    pub schedulable: bool,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }
}
