use std::fmt::Write;

use kubengine_core_domain::{ClusterConfig, StepStatus};
use kubengine_executor::{DeploymentReport, ReportEntry, StepRegistry};

use crate::CliError;

const DETAIL_LINES: usize = 5;

/// Human view of the resolved cluster and its step plan.
pub fn render_config(config: &ClusterConfig, registry: &StepRegistry) -> Result<String, CliError> {
    let mut out = String::new();
    let _ = writeln!(out, "domain: {}", config.domain);
    let _ = writeln!(out, "pod cidr: {}", config.pod_cidr);
    let _ = writeln!(out, "service cidr: {}", config.service_cidr);
    let ranges: Vec<String> = config.lb_ip_ranges.iter().map(|range| range.to_string()).collect();
    let _ = writeln!(out, "lb pools: {}", ranges.join(", "));
    let _ = writeln!(out, "lb vip: {}", config.loadbalancer_vip);
    let nameservers: Vec<String> = config.nameservers.iter().map(|ns| ns.to_string()).collect();
    let _ = writeln!(out, "nameservers: {}", nameservers.join(", "));

    let _ = writeln!(out, "nodes:");
    for node in &config.nodes {
        let schedulable = if node.schedulable { "" } else { " (unschedulable)" };
        let _ = writeln!(
            out,
            "  - {:<15} {:<20} {}{}",
            node.address, node.hostname, node.role, schedulable
        );
    }

    let _ = writeln!(out, "steps:");
    for (index, group) in registry.resolve()?.iter().enumerate() {
        for step in group {
            let roles: Vec<String> = step.roles.iter().map(|role| role.to_string()).collect();
            let mut line = format!(
                "  [{}] {} ({}) action={}",
                index + 1,
                step.name,
                roles.join(","),
                step.action.key()
            );
            if !step.depends_on.is_empty() {
                let _ = write!(line, " after={}", step.depends_on.join(","));
            }
            if step.critical {
                line.push_str(" critical");
            }
            let _ = writeln!(out, "{line}");
        }
    }
    Ok(out)
}

/// One line per terminal (node, step), printed as results arrive.
pub fn render_progress(entry: &ReportEntry) -> String {
    let mut line = format!("[{}] {} {}", entry.status, entry.node, entry.step);
    match entry.status {
        StepStatus::Failed => {
            if let Some(code) = entry.exit_code {
                let _ = write!(line, " (exit {code})");
            }
            if entry.attempt_count > 1 {
                let _ = write!(line, " attempt {}", entry.attempt_count);
            }
        }
        StepStatus::Pending => {
            if let Some(reason) = &entry.blocked_by {
                let _ = write!(line, " ({reason})");
            }
        }
        _ => {}
    }
    line
}

/// Per-node breakdown followed by a one-line summary.
pub fn render_report(report: &DeploymentReport, config: &ClusterConfig) -> String {
    let mut out = String::new();
    for node in &config.nodes {
        let entries: Vec<&ReportEntry> = report.for_node(&node.address).collect();
        if entries.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{} ({}, {})", node.address, node.hostname, node.role);
        for entry in entries {
            let _ = writeln!(out, "  {:<8} {}", entry.status.as_str(), entry.step);
            match entry.status {
                StepStatus::Failed => {
                    if let Some(code) = entry.exit_code {
                        let _ = writeln!(out, "           exit code: {code}");
                    }
                    if let Some(detail) = &entry.error_detail {
                        for line in tail_lines(detail, DETAIL_LINES) {
                            let _ = writeln!(out, "           | {line}");
                        }
                    }
                }
                StepStatus::Pending => {
                    if let Some(reason) = &entry.blocked_by {
                        let _ = writeln!(out, "           blocked: {reason}");
                    }
                }
                _ => {}
            }
        }
    }

    let summary = report.summary();
    if let Some(reason) = &report.halted {
        let _ = writeln!(out, "halted: {reason}");
    }
    if report.cancelled {
        let _ = writeln!(out, "cancelled: remaining steps were not started");
    }
    let counts = format!(
        "{} succeeded, {} skipped, {} failed, {} pending",
        summary.success, summary.skipped, summary.failed, summary.pending
    );
    if report.is_success() {
        let _ = writeln!(
            out,
            "deployment complete: {counts}; load balancer vip {}",
            config.loadbalancer_vip
        );
    } else {
        let _ = writeln!(
            out,
            "deployment incomplete: {counts}; fix the failures and run deploy again to resume"
        );
    }
    out
}

pub fn render_report_json(report: &DeploymentReport) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(report)?)
}

fn tail_lines(text: &str, limit: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].to_vec()
}
