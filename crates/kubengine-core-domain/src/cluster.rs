use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Node, Role, RoleFilter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterConfigError {
    NoNodes,
    NoMaster,
    MultipleMasters { count: usize },
    InvalidAddress { field: String, value: String },
    InvalidCidr { field: String, value: String },
    InvalidLbRange { value: String, message: String },
    EmptyLbPool,
    DuplicateAddress { address: String },
    InvalidHostname { address: String, hostname: String },
    DuplicateHostname { hostname: String },
    EmptyNameservers,
    Overlap { left: String, right: String },
}

impl std::fmt::Display for ClusterConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterConfigError::NoNodes => write!(f, "cluster declares no nodes"),
            ClusterConfigError::NoMaster => write!(f, "at least one master node is required"),
            ClusterConfigError::MultipleMasters { count } => write!(
                f,
                "{count} master nodes declared; a single master is supported, declare the others as workers"
            ),
            ClusterConfigError::InvalidAddress { field, value } => {
                write!(f, "{field} '{value}' is not a valid IPv4 address")
            }
            ClusterConfigError::InvalidCidr { field, value } => {
                write!(f, "{field} '{value}' is not a valid IPv4 CIDR")
            }
            ClusterConfigError::InvalidLbRange { value, message } => {
                write!(f, "invalid load-balancer pool entry '{value}': {message}")
            }
            ClusterConfigError::EmptyLbPool => write!(f, "load-balancer ip pool must not be empty"),
            ClusterConfigError::DuplicateAddress { address } => {
                write!(f, "node address {address} is declared more than once")
            }
            ClusterConfigError::InvalidHostname { address, hostname } => {
                write!(f, "node {address} has invalid hostname '{hostname}'")
            }
            ClusterConfigError::DuplicateHostname { hostname } => {
                write!(f, "hostname {hostname} is used by more than one node")
            }
            ClusterConfigError::EmptyNameservers => write!(f, "nameserver list must not be empty"),
            ClusterConfigError::Overlap { left, right } => {
                write!(f, "{left} overlaps {right}")
            }
        }
    }
}

impl std::error::Error for ClusterConfigError {}

/// Inclusive IPv4 address range handed to the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LbRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl LbRange {
    /// Accepts `a-b`, a CIDR, or a single address.
    pub fn parse(value: &str) -> Result<Self, ClusterConfigError> {
        let trimmed = value.trim();
        let invalid = |message: &str| ClusterConfigError::InvalidLbRange {
            value: trimmed.to_string(),
            message: message.to_string(),
        };

        if let Some((start, end)) = trimmed.split_once('-') {
            let start = Ipv4Addr::from_str(start.trim())
                .map_err(|_| invalid("range start is not an IPv4 address"))?;
            let end = Ipv4Addr::from_str(end.trim())
                .map_err(|_| invalid("range end is not an IPv4 address"))?;
            if u32::from(start) > u32::from(end) {
                return Err(invalid("range start is after range end"));
            }
            return Ok(Self { start, end });
        }

        if trimmed.contains('/') {
            let net = Ipv4Net::from_str(trimmed).map_err(|_| invalid("malformed CIDR"))?;
            return Ok(Self::from_net(&net));
        }

        let address =
            Ipv4Addr::from_str(trimmed).map_err(|_| invalid("not an IPv4 address"))?;
        Ok(Self {
            start: address,
            end: address,
        })
    }

    pub fn from_net(net: &Ipv4Net) -> Self {
        let net = net.trunc();
        Self {
            start: net.network(),
            end: net.broadcast(),
        }
    }

    pub fn overlaps(&self, other: &LbRange) -> bool {
        u32::from(self.start) <= u32::from(other.end)
            && u32::from(other.start) <= u32::from(self.end)
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let value = u32::from(address);
        u32::from(self.start) <= value && value <= u32::from(self.end)
    }
}

impl std::fmt::Display for LbRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Declarative step entry from the cluster file; resolved by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default = "default_step_roles")]
    pub roles: Vec<RoleFilter>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Built-in action key, or `shell` to run `commands`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_step_roles() -> Vec<RoleFilter> {
    vec![RoleFilter::Any]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNode {
    pub address: String,
    pub hostname: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedulable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCidr {
    #[serde(default = "default_pod_cidr")]
    pub pod: String,
    #[serde(default = "default_service_cidr")]
    pub service: String,
}

impl Default for RawCidr {
    fn default() -> Self {
        Self {
            pod: default_pod_cidr(),
            service: default_service_cidr(),
        }
    }
}

fn default_pod_cidr() -> String {
    "10.96.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.97.0.0/16".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLoadBalancer {
    #[serde(default)]
    pub ip_pools: Vec<String>,
}

/// Cluster description as written by the operator, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawClusterConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub cidr: RawCidr,
    #[serde(default)]
    pub loadbalancer: RawLoadBalancer,
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
}

fn default_domain() -> String {
    "kubengine.io".to_string()
}

fn default_nameservers() -> Vec<String> {
    vec!["8.8.8.8".to_string()]
}

impl RawClusterConfig {
    pub fn validate(&self) -> Result<ClusterConfig, ClusterConfigError> {
        if self.nodes.is_empty() {
            return Err(ClusterConfigError::NoNodes);
        }

        let mut addresses = HashSet::new();
        let mut hostnames = HashSet::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for raw in &self.nodes {
            let address = parse_ipv4("node address", &raw.address)?;
            if !addresses.insert(address) {
                return Err(ClusterConfigError::DuplicateAddress {
                    address: address.to_string(),
                });
            }
            let hostname = raw.hostname.trim().to_lowercase();
            if !is_valid_hostname(&hostname) {
                return Err(ClusterConfigError::InvalidHostname {
                    address: address.to_string(),
                    hostname: raw.hostname.clone(),
                });
            }
            if !hostnames.insert(hostname.clone()) {
                return Err(ClusterConfigError::DuplicateHostname { hostname });
            }
            nodes.push(Node {
                address: address.to_string(),
                hostname,
                role: raw.role,
                schedulable: raw.schedulable.unwrap_or(raw.role == Role::Worker),
            });
        }

        match nodes.iter().filter(|node| node.is_master()).count() {
            0 => return Err(ClusterConfigError::NoMaster),
            1 => {}
            count => return Err(ClusterConfigError::MultipleMasters { count }),
        }

        let pod_cidr = parse_cidr("pod CIDR", &self.cidr.pod)?;
        let service_cidr = parse_cidr("service CIDR", &self.cidr.service)?;

        if self.loadbalancer.ip_pools.is_empty() {
            return Err(ClusterConfigError::EmptyLbPool);
        }
        let mut lb_ip_ranges = Vec::with_capacity(self.loadbalancer.ip_pools.len());
        for entry in &self.loadbalancer.ip_pools {
            lb_ip_ranges.push(LbRange::parse(entry)?);
        }
        let loadbalancer_vip = first_pool_address(&self.loadbalancer.ip_pools[0])?;

        if self.nameservers.is_empty() {
            return Err(ClusterConfigError::EmptyNameservers);
        }
        let mut nameservers = Vec::with_capacity(self.nameservers.len());
        for value in &self.nameservers {
            nameservers.push(parse_ipv4("nameserver", value)?);
        }

        let config = ClusterConfig {
            nodes,
            pod_cidr,
            service_cidr,
            lb_ip_ranges,
            loadbalancer_vip,
            nameservers,
            domain: self.domain.trim().to_string(),
        };
        config.check_overlaps()?;
        Ok(config)
    }
}

/// Validated cluster layout; the orchestrator consumes only this form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<Node>,
    pub pod_cidr: Ipv4Net,
    pub service_cidr: Ipv4Net,
    pub lb_ip_ranges: Vec<LbRange>,
    pub loadbalancer_vip: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,
    pub domain: String,
}

impl ClusterConfig {
    pub fn masters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.is_master())
    }

    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| !node.is_master())
    }

    /// The control-plane node. Join tokens and helm commands run there.
    pub fn primary_master(&self) -> Option<&Node> {
        self.masters().next()
    }

    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.address == address)
    }

    /// SHA-256 of the canonical JSON form, hex encoded. Used to notice
    /// config drift between runs.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn check_overlaps(&self) -> Result<(), ClusterConfigError> {
        let mut blocks: Vec<(String, LbRange)> = vec![
            (
                format!("pod CIDR {}", self.pod_cidr),
                LbRange::from_net(&self.pod_cidr),
            ),
            (
                format!("service CIDR {}", self.service_cidr),
                LbRange::from_net(&self.service_cidr),
            ),
        ];
        for range in &self.lb_ip_ranges {
            blocks.push((format!("load-balancer range {range}"), *range));
        }

        for (index, (left_label, left)) in blocks.iter().enumerate() {
            for (right_label, right) in blocks.iter().skip(index + 1) {
                if left.overlaps(right) {
                    return Err(ClusterConfigError::Overlap {
                        left: left_label.clone(),
                        right: right_label.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr, ClusterConfigError> {
    Ipv4Addr::from_str(value.trim()).map_err(|_| ClusterConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_cidr(field: &str, value: &str) -> Result<Ipv4Net, ClusterConfigError> {
    Ipv4Net::from_str(value.trim())
        .map(|net| net.trunc())
        .map_err(|_| ClusterConfigError::InvalidCidr {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn first_pool_address(entry: &str) -> Result<Ipv4Addr, ClusterConfigError> {
    let trimmed = entry.trim();
    if !trimmed.contains('-') && trimmed.contains('/') {
        let net = parse_cidr("load-balancer CIDR", trimmed)?;
        let first = u32::from(net.network()).saturating_add(1);
        return Ok(Ipv4Addr::from(first.min(u32::from(net.broadcast()))));
    }
    Ok(LbRange::parse(trimmed)?.start)
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    })
}
