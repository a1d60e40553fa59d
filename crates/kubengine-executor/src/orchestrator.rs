use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use kubengine_core_domain::{
    ClusterConfig, DeploymentState, Node, ResetScope, StepResult, StepStatus,
};
use kubengine_ssh::{SessionPool, SshClient, SshCommandResult, SshTarget};
use kubengine_storage::{ResultHistory, StateStore};
use tracing::{debug, error, info, warn};

use crate::actions::{ActionError, CommandRunner, StepContext};
use crate::registry::{Step, StepRegistry};
use crate::report::{DeploymentReport, ReportEntry};
use crate::ExecutionError;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Shared stop flag. Cancelling stops new tasks from starting; in-flight
/// commands run to completion or timeout.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The underlying flag, for components that only need to observe it.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Returns `false` if cancelled before `duration` elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            password: None,
        }
    }
}

impl SshCredentials {
    pub fn target_for(&self, node: &Node) -> SshTarget {
        SshTarget {
            host: node.address.clone(),
            user: self.user.clone(),
            port: self.port,
            identity_file: self.identity_file.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Upper bound on simultaneous remote sessions.
    pub concurrency: usize,
    /// Extra attempts after a non-zero exit or timeout.
    pub step_retries: u32,
    pub step_retry_delay: Duration,
    pub command_timeout: Duration,
    /// Re-run pairs already recorded as success.
    pub force: bool,
    pub deploy_src: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            step_retries: 1,
            step_retry_delay: Duration::from_secs(5),
            command_timeout: Duration::from_secs(600),
            force: false,
            deploy_src: "/root/offline-deploy".to_string(),
        }
    }
}

pub type ProgressCallback = Box<dyn Fn(&ReportEntry) + Send + Sync>;

pub struct Orchestrator<'a> {
    cluster: &'a ClusterConfig,
    registry: &'a StepRegistry,
    client: &'a dyn SshClient,
    store: &'a dyn StateStore,
    history: Option<&'a ResultHistory>,
    credentials: SshCredentials,
    options: DeployOptions,
    cancel: CancellationToken,
    progress_callback: Option<ProgressCallback>,
}

struct Task<'t> {
    step: &'t Step,
    node: &'t Node,
    prior_attempts: u32,
    /// Recorded result before this run, put back if the task is cancelled.
    previous: Option<StepResult>,
}

enum TaskEvent {
    Started(StepResult),
    Finished {
        result: StepResult,
        critical: bool,
        on_master: bool,
    },
    /// Cancellation cut the task short before it reached a verdict.
    Cancelled {
        node: String,
        step: String,
        previous: Option<StepResult>,
    },
}

/// Everything the coordinating routine mutates during a run.
struct RunProgress {
    state: DeploymentState,
    excluded: BTreeMap<String, String>,
    halted: Option<String>,
    cancelled: bool,
    entries: Vec<ReportEntry>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        cluster: &'a ClusterConfig,
        registry: &'a StepRegistry,
        client: &'a dyn SshClient,
        store: &'a dyn StateStore,
        credentials: SshCredentials,
        options: DeployOptions,
    ) -> Self {
        Self {
            cluster,
            registry,
            client,
            store,
            history: None,
            credentials,
            options,
            cancel: CancellationToken::new(),
            progress_callback: None,
        }
    }

    pub fn with_history(mut self, history: &'a ResultHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ReportEntry) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn deploy(&self) -> Result<DeploymentReport, ExecutionError> {
        let groups = self.registry.resolve()?;
        match self.cluster.masters().count() {
            0 => {
                return Err(ExecutionError::Config {
                    message: "at least one master node is required".to_string(),
                })
            }
            1 => {}
            count => {
                return Err(ExecutionError::Config {
                    message: format!("exactly one master node is supported, found {count}"),
                })
            }
        }

        let mut state = self.store.load()?;
        let fingerprint = self.cluster.fingerprint();
        let fingerprint_changed = state.config_fingerprint.as_deref() != Some(fingerprint.as_str());
        if let Some(previous) = state.config_fingerprint.as_deref() {
            if previous != fingerprint {
                warn!(
                    previous,
                    current = %fingerprint,
                    "cluster config changed since the last run; recorded successes are still honoured, use reset-state to re-run them"
                );
            }
        }
        state.config_fingerprint = Some(fingerprint);

        let mut progress = RunProgress {
            state,
            excluded: BTreeMap::new(),
            halted: None,
            cancelled: false,
            entries: Vec::new(),
        };
        let pool = SessionPool::new(self.options.concurrency);
        let outcome = self.run_groups(&groups, &pool, &mut progress, fingerprint_changed);
        pool.shutdown(self.client);
        outcome?;

        let report = DeploymentReport {
            entries: progress.entries,
            halted: progress.halted,
            cancelled: progress.cancelled,
        };
        let summary = report.summary();
        info!(
            success = summary.success,
            skipped = summary.skipped,
            failed = summary.failed,
            pending = summary.pending,
            "deployment finished"
        );
        Ok(report)
    }

    fn run_groups(
        &self,
        groups: &[Vec<&Step>],
        pool: &SessionPool,
        progress: &mut RunProgress,
        mut dirty: bool,
    ) -> Result<(), ExecutionError> {
        let node_order: HashMap<&str, usize> = self
            .cluster
            .nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.address.as_str(), position))
            .collect();
        let halt = AtomicBool::new(false);

        for (index, group) in groups.iter().enumerate() {
            if progress.halted.is_none() && self.cancel.is_cancelled() && !progress.cancelled {
                warn!(group = index + 1, "cancellation requested; no further steps will start");
                progress.cancelled = true;
            }
            let stop_reason = progress
                .halted
                .clone()
                .or_else(|| progress.cancelled.then(|| "cancelled".to_string()));

            let group_start = progress.entries.len();
            let mut tasks = Vec::new();
            for &step in group {
                for node in self.cluster.nodes.iter().filter(|node| step.applies_to(node.role)) {
                    if let Some(reason) = stop_reason.as_ref().or(progress.excluded.get(&node.address)) {
                        progress
                            .entries
                            .push(ReportEntry::pending(&node.address, &step.name, reason.clone()));
                        continue;
                    }
                    let previous = progress.state.get(&node.address, &step.name);
                    if let Some(done) = previous.filter(|r| r.status == StepStatus::Success) {
                        if !self.options.force {
                            debug!(node = %node.address, step = %step.name, "already succeeded, skipping");
                            let entry = ReportEntry::skipped(done);
                            self.notify(&entry);
                            progress.entries.push(entry);
                            continue;
                        }
                    }
                    if let Some(reason) = self.unmet_dependency(step, node, &progress.state) {
                        progress
                            .entries
                            .push(ReportEntry::pending(&node.address, &step.name, reason));
                        continue;
                    }
                    let prior_attempts = previous
                        .filter(|r| r.status != StepStatus::Success)
                        .map(|r| r.attempt_count)
                        .unwrap_or(0);
                    tasks.push(Task {
                        step,
                        node,
                        prior_attempts,
                        previous: previous.cloned(),
                    });
                }
            }

            if !tasks.is_empty() {
                info!(group = index + 1, tasks = tasks.len(), "running step group");
                let not_started = self.run_group(tasks, pool, &halt, &mut |event: TaskEvent| {
                    self.absorb(event, progress, &halt)
                });
                if !not_started.is_empty() {
                    let reason = match progress.halted.clone() {
                        Some(reason) => reason,
                        None => {
                            progress.cancelled = true;
                            "cancelled".to_string()
                        }
                    };
                    for task in not_started {
                        progress.entries.push(ReportEntry::pending(
                            &task.node.address,
                            &task.step.name,
                            reason.clone(),
                        ));
                    }
                }

                progress.state.updated_at = Some(Utc::now());
                self.store.save(&progress.state)?;
                dirty = false;
            }

            let step_order: HashMap<&str, usize> = group
                .iter()
                .enumerate()
                .map(|(position, step)| (step.name.as_str(), position))
                .collect();
            progress.entries[group_start..].sort_by_key(|entry| {
                (
                    step_order.get(entry.step.as_str()).copied().unwrap_or(usize::MAX),
                    node_order.get(entry.node.as_str()).copied().unwrap_or(usize::MAX),
                )
            });
        }

        if dirty {
            progress.state.updated_at = Some(Utc::now());
            self.store.save(&progress.state)?;
        }
        Ok(())
    }

    /// Fans tasks out over a bounded set of workers. Results flow back over a
    /// channel to `on_event`, which runs on the calling thread. Returns the
    /// tasks that never started because of cancellation or a halt.
    fn run_group<'t>(
        &self,
        tasks: Vec<Task<'t>>,
        pool: &SessionPool,
        halt: &AtomicBool,
        on_event: &mut dyn FnMut(TaskEvent),
    ) -> Vec<Task<'t>> {
        let workers = self.options.concurrency.max(1).min(tasks.len());
        let queue = Mutex::new(VecDeque::from(tasks));
        let (tx, rx) = mpsc::channel::<TaskEvent>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    if self.cancel.is_cancelled() || halt.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(task) = next else {
                        break;
                    };
                    self.execute(&task, pool, &tx);
                });
            }
            drop(tx);
            for event in rx {
                on_event(event);
            }
        });

        queue
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .collect()
    }

    fn execute(&self, task: &Task<'_>, pool: &SessionPool, tx: &mpsc::Sender<TaskEvent>) {
        let step = task.step;
        let node = task.node;
        let started_at = Utc::now();
        let _ = tx.send(TaskEvent::Started(StepResult::running(
            &node.address,
            &step.name,
            task.prior_attempts + 1,
            started_at,
        )));

        let max_attempts = step
            .retries
            .unwrap_or(self.options.step_retries)
            .saturating_add(1);
        let ctx = StepContext {
            node,
            cluster: self.cluster,
            deploy_src: &self.options.deploy_src,
        };
        let mut runner = PooledRunner {
            client: self.client,
            pool,
            credentials: &self.credentials,
            scope: &step.name,
            timeout: step.timeout.unwrap_or(self.options.command_timeout),
        };

        let mut attempt = 1;
        let outcome = loop {
            info!(node = %node.address, step = %step.name, attempt, "running step");
            let running =
                StepResult::running(&node.address, &step.name, task.prior_attempts + attempt, started_at);
            match step.action.run(&ctx, &mut runner) {
                Ok(()) => {
                    info!(node = %node.address, step = %step.name, attempt, "step succeeded");
                    break Some(running.succeeded(Utc::now(), Some(0)));
                }
                Err(err) => {
                    if err.is_transient() && attempt < max_attempts {
                        if !self.cancel.is_cancelled() {
                            warn!(node = %node.address, step = %step.name, attempt, error = %err, "step failed, retrying");
                            if self.cancel.sleep(self.options.step_retry_delay) {
                                attempt += 1;
                                continue;
                            }
                        }
                        warn!(node = %node.address, step = %step.name, attempt, error = %err, "retry abandoned on cancellation");
                        break None;
                    }
                    if err.is_connection() && self.cancel.is_cancelled() {
                        warn!(node = %node.address, step = %step.name, error = %err, "connection lost after cancellation");
                        break None;
                    }
                    error!(node = %node.address, step = %step.name, attempt, error = %err, "step failed");
                    break Some(running.failed(Utc::now(), err.to_string(), err.exit_code()));
                }
            }
        };

        let event = match outcome {
            Some(result) => TaskEvent::Finished {
                result,
                critical: step.critical,
                on_master: node.is_master(),
            },
            None => TaskEvent::Cancelled {
                node: node.address.clone(),
                step: step.name.clone(),
                previous: task.previous.clone(),
            },
        };
        let _ = tx.send(event);
    }

    fn absorb(&self, event: TaskEvent, progress: &mut RunProgress, halt: &AtomicBool) {
        match event {
            TaskEvent::Started(result) => progress.state.record(result),
            TaskEvent::Finished {
                result,
                critical,
                on_master,
            } => {
                if let Some(history) = self.history {
                    if let Err(err) = history.append(&result) {
                        warn!(error = %err, "failed to append result history");
                    }
                }
                let entry = ReportEntry::from_result(&result);
                if result.status == StepStatus::Failed {
                    progress.excluded.insert(
                        result.node.clone(),
                        format!("{} failed on {}", result.step, result.node),
                    );
                    if critical && on_master && progress.halted.is_none() {
                        let reason = format!(
                            "critical step {} failed on master {}",
                            result.step, result.node
                        );
                        error!(reason = %reason, "halting deployment");
                        progress.halted = Some(reason);
                        halt.store(true, Ordering::SeqCst);
                    }
                }
                progress.state.record(result);
                self.notify(&entry);
                progress.entries.push(entry);
            }
            TaskEvent::Cancelled {
                node,
                step,
                previous,
            } => {
                match previous {
                    Some(previous) => progress.state.record(previous),
                    None => {
                        progress.state.reset(&ResetScope::NodeStep {
                            node: node.clone(),
                            step: step.clone(),
                        });
                    }
                }
                progress.cancelled = true;
                let entry = ReportEntry::pending(&node, &step, "cancelled");
                self.notify(&entry);
                progress.entries.push(entry);
            }
        }
    }

    /// A dependency that applies to the node's role must have succeeded on
    /// that node. One that does not must have succeeded on at least one node
    /// it applies to, or apply to none.
    fn unmet_dependency(&self, step: &Step, node: &Node, state: &DeploymentState) -> Option<String> {
        for name in &step.depends_on {
            let Some(dependency) = self.registry.get(name) else {
                continue;
            };
            if dependency.applies_to(node.role) {
                if !state.is_success(&node.address, name) {
                    return Some(format!("{} has not succeeded on {}", name, node.address));
                }
                continue;
            }
            let mut applicable = self
                .cluster
                .nodes
                .iter()
                .filter(|other| dependency.applies_to(other.role))
                .peekable();
            if applicable.peek().is_none() {
                continue;
            }
            if !applicable.any(|other| state.is_success(&other.address, name)) {
                return Some(format!("{} has not succeeded on any node", name));
            }
        }
        None
    }

    fn notify(&self, entry: &ReportEntry) {
        if let Some(callback) = self.progress_callback.as_ref() {
            callback(entry);
        }
    }
}

/// Runs each command under a pool lease scoped to (node, step).
struct PooledRunner<'r> {
    client: &'r dyn SshClient,
    pool: &'r SessionPool,
    credentials: &'r SshCredentials,
    scope: &'r str,
    timeout: Duration,
}

impl CommandRunner for PooledRunner<'_> {
    fn run(&mut self, node: &Node, command: &str) -> Result<SshCommandResult, ActionError> {
        let target = self.credentials.target_for(node);
        let lease = self.pool.acquire(&target, self.scope);
        debug!(node = %node.address, step = self.scope, command, "remote command");
        let result = lease.execute(self.client, command, self.timeout)?;
        if !result.success() {
            debug!(
                node = %node.address,
                step = self.scope,
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "remote command exited non-zero"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubengine_core_domain::{
        RawCidr, RawClusterConfig, RawLoadBalancer, RawNode, Role, RoleFilter, StepSpec,
    };
    use kubengine_ssh::SshError;
    use kubengine_storage::{InMemoryStateStore, JsonFileStateStore, StorageError};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Outcome {
        Exit(i32),
        Connection,
    }

    struct Rule {
        host: String,
        needle: String,
        outcome: Outcome,
        times: Option<usize>,
    }

    #[derive(Default)]
    struct MockClient {
        calls: Mutex<Vec<(String, String)>>,
        rules: Mutex<Vec<Rule>>,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        /// Cancels the token shortly after a command containing the needle runs.
        cancel_after: Option<(String, CancellationToken)>,
    }

    impl MockClient {
        fn new() -> Self {
            Self::default()
        }

        fn fail(self, host: &str, needle: &str, outcome: Outcome) -> Self {
            self.add_rule(host, needle, outcome, None)
        }

        fn fail_times(self, host: &str, needle: &str, outcome: Outcome, times: usize) -> Self {
            self.add_rule(host, needle, outcome, Some(times))
        }

        fn add_rule(self, host: &str, needle: &str, outcome: Outcome, times: Option<usize>) -> Self {
            self.rules.lock().expect("rules").push(Rule {
                host: host.to_string(),
                needle: needle.to_string(),
                outcome,
                times,
            });
            self
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().expect("calls").clone()
        }

        fn count(&self, host: &str, needle: &str) -> usize {
            self.calls()
                .iter()
                .filter(|(h, command)| h == host && command.contains(needle))
                .count()
        }
    }

    impl SshClient for MockClient {
        fn execute(
            &self,
            target: &SshTarget,
            command: &str,
            _timeout: Duration,
        ) -> Result<SshCommandResult, SshError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.calls
                .lock()
                .expect("calls")
                .push((target.host.clone(), command.to_string()));
            if let Some((needle, token)) = self.cancel_after.as_ref() {
                if command.contains(needle.as_str()) {
                    let token = token.clone();
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(100));
                        token.cancel();
                    });
                }
            }

            let mut rules = self.rules.lock().expect("rules");
            let matched = rules.iter_mut().find(|rule| {
                rule.host == target.host
                    && command.contains(&rule.needle)
                    && rule.times != Some(0)
            });
            let outcome = matched.map(|rule| {
                if let Some(times) = rule.times.as_mut() {
                    *times -= 1;
                }
                rule.outcome.clone()
            });
            match outcome {
                Some(Outcome::Connection) => Err(SshError::Connection {
                    message: "connection refused".to_string(),
                }),
                Some(Outcome::Exit(code)) => Ok(SshCommandResult {
                    stdout: String::new(),
                    stderr: format!("{command} broke"),
                    exit_code: code,
                }),
                None => Ok(SshCommandResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                }),
            }
        }
    }

    fn node(address: &str, hostname: &str, role: Role) -> RawNode {
        RawNode {
            address: address.to_string(),
            hostname: hostname.to_string(),
            role,
            schedulable: None,
        }
    }

    fn cluster_with(nodes: Vec<RawNode>) -> ClusterConfig {
        RawClusterConfig {
            domain: "kubengine.io".to_string(),
            nodes,
            cidr: RawCidr {
                pod: "10.96.0.0/16".to_string(),
                service: "10.97.0.0/16".to_string(),
            },
            loadbalancer: RawLoadBalancer {
                ip_pools: vec!["10.0.0.200-10.0.0.220".to_string()],
            },
            nameservers: vec!["8.8.8.8".to_string()],
            steps: Vec::new(),
        }
        .validate()
        .expect("valid cluster")
    }

    fn cluster() -> ClusterConfig {
        cluster_with(vec![
            node("10.0.0.1", "master-1", Role::Master),
            node("10.0.0.2", "worker-1", Role::Worker),
            node("10.0.0.3", "worker-2", Role::Worker),
        ])
    }

    fn spec(name: &str, role: RoleFilter, depends_on: &[&str], critical: bool) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            roles: vec![role],
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            action: "shell".to_string(),
            commands: vec![format!("echo {name} on {{address}}")],
            retries: None,
            critical,
            timeout_secs: None,
        }
    }

    fn registry() -> StepRegistry {
        StepRegistry::from_specs(&[
            spec("disable-firewall", RoleFilter::Any, &[], false),
            spec("init-control-plane", RoleFilter::Master, &["disable-firewall"], true),
            spec("join-worker", RoleFilter::Worker, &["init-control-plane"], false),
            spec("install-lb", RoleFilter::Master, &["join-worker"], false),
        ])
        .expect("registry")
    }

    fn options() -> DeployOptions {
        DeployOptions {
            concurrency: 4,
            step_retries: 0,
            step_retry_delay: Duration::ZERO,
            command_timeout: Duration::from_secs(5),
            force: false,
            deploy_src: "/root/offline-deploy".to_string(),
        }
    }

    fn deploy(
        cluster: &ClusterConfig,
        registry: &StepRegistry,
        client: &MockClient,
        store: &dyn StateStore,
        options: DeployOptions,
    ) -> Result<DeploymentReport, ExecutionError> {
        Orchestrator::new(
            cluster,
            registry,
            client,
            store,
            SshCredentials::default(),
            options,
        )
        .deploy()
    }

    fn status(report: &DeploymentReport, node: &str, step: &str) -> Option<StepStatus> {
        report.entry(node, step).map(|entry| entry.status)
    }

    #[test]
    fn worker_join_failure_is_isolated_and_master_continues() {
        let cluster = cluster();
        let registry = registry();
        let client = MockClient::new().fail("10.0.0.3", "join-worker", Outcome::Exit(1));
        let store = InMemoryStateStore::default();

        let report = deploy(&cluster, &registry, &client, &store, options()).expect("deploy");

        assert_eq!(status(&report, "10.0.0.2", "disable-firewall"), Some(StepStatus::Success));
        assert_eq!(status(&report, "10.0.0.2", "join-worker"), Some(StepStatus::Success));
        let failed = report.entry("10.0.0.3", "join-worker").expect("entry");
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.exit_code, Some(1));
        assert!(failed
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .contains("broke"));
        assert_eq!(status(&report, "10.0.0.1", "install-lb"), Some(StepStatus::Success));
        assert!(report.entry("10.0.0.3", "install-lb").is_none());
        assert!(report.halted.is_none());
        assert_eq!(report.exit_code(), 2);

        let state = store.snapshot();
        assert_eq!(
            state.get("10.0.0.3", "join-worker").map(|r| r.status),
            Some(StepStatus::Failed)
        );
        assert!(state.is_success("10.0.0.1", "install-lb"));
        assert!(state.config_fingerprint.is_some());
    }

    #[test]
    fn second_run_without_changes_makes_no_remote_calls() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let first = MockClient::new();
        let report = deploy(&cluster, &registry, &first, &store, options()).expect("deploy");
        assert_eq!(report.exit_code(), 0);
        assert!(!first.calls().is_empty());

        let second = MockClient::new();
        let report = deploy(&cluster, &registry, &second, &store, options()).expect("deploy");
        assert!(second.calls().is_empty());
        assert!(report
            .entries
            .iter()
            .all(|entry| entry.status == StepStatus::Skipped));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn resume_only_retries_the_failed_group_onwards() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let failing = MockClient::new().fail("10.0.0.3", "join-worker", Outcome::Exit(1));
        deploy(&cluster, &registry, &failing, &store, options()).expect("deploy");

        let healthy = MockClient::new();
        let report = deploy(&cluster, &registry, &healthy, &store, options()).expect("deploy");
        assert_eq!(
            healthy.calls(),
            vec![(
                "10.0.0.3".to_string(),
                "echo join-worker on 10.0.0.3".to_string()
            )]
        );
        let joined = report.entry("10.0.0.3", "join-worker").expect("entry");
        assert_eq!(joined.status, StepStatus::Success);
        assert_eq!(joined.attempt_count, 2);
        assert_eq!(
            status(&report, "10.0.0.3", "disable-firewall"),
            Some(StepStatus::Skipped)
        );
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn connection_error_excludes_only_that_node() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let client = MockClient::new().fail("10.0.0.2", "disable-firewall", Outcome::Connection);
        let mut opts = options();
        opts.step_retries = 3;

        let report = deploy(&cluster, &registry, &client, &store, opts).expect("deploy");
        assert_eq!(client.count("10.0.0.2", "disable-firewall"), 1);
        assert_eq!(status(&report, "10.0.0.2", "disable-firewall"), Some(StepStatus::Failed));
        let blocked = report.entry("10.0.0.2", "join-worker").expect("entry");
        assert_eq!(blocked.status, StepStatus::Pending);
        assert!(blocked
            .blocked_by
            .as_deref()
            .unwrap_or_default()
            .contains("disable-firewall failed"));
        assert_eq!(status(&report, "10.0.0.3", "join-worker"), Some(StepStatus::Success));
        assert_eq!(status(&report, "10.0.0.1", "install-lb"), Some(StepStatus::Success));
        assert_eq!(report.exit_code(), 2);
        assert!(store.snapshot().get("10.0.0.2", "join-worker").is_none());
    }

    #[test]
    fn transient_command_failure_is_retried_at_step_level() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let client =
            MockClient::new().fail_times("10.0.0.2", "join-worker", Outcome::Exit(1), 1);
        let mut opts = options();
        opts.step_retries = 1;

        let report = deploy(&cluster, &registry, &client, &store, opts).expect("deploy");
        let joined = report.entry("10.0.0.2", "join-worker").expect("entry");
        assert_eq!(joined.status, StepStatus::Success);
        assert_eq!(joined.attempt_count, 2);
        assert_eq!(client.count("10.0.0.2", "join-worker"), 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn critical_failure_on_sole_master_halts_the_run() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let client = MockClient::new().fail("10.0.0.1", "init-control-plane", Outcome::Exit(1));

        let report = deploy(&cluster, &registry, &client, &store, options()).expect("deploy");
        assert!(report
            .halted
            .as_deref()
            .unwrap_or_default()
            .contains("init-control-plane"));
        assert_eq!(client.count("10.0.0.2", "join-worker"), 0);
        assert_eq!(client.count("10.0.0.3", "join-worker"), 0);
        assert_eq!(status(&report, "10.0.0.2", "join-worker"), Some(StepStatus::Pending));
        assert_eq!(status(&report, "10.0.0.1", "install-lb"), Some(StepStatus::Pending));
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn second_master_is_refused_before_any_remote_call() {
        let mut cluster = cluster();
        cluster.nodes.push(Node {
            address: "10.0.0.4".to_string(),
            hostname: "master-2".to_string(),
            role: Role::Master,
            schedulable: false,
        });
        let client = MockClient::new();
        let store = InMemoryStateStore::default();

        let err = deploy(&cluster, &registry(), &client, &store, options()).expect_err("config");
        assert!(matches!(err, ExecutionError::Config { .. }));
        assert!(err.to_string().contains("found 2"));
        assert!(client.calls().is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn reset_forces_full_re_execution() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        deploy(&cluster, &registry, &MockClient::new(), &store, options()).expect("deploy");
        store.reset(&ResetScope::All).expect("reset");

        let client = MockClient::new();
        let report = deploy(&cluster, &registry, &client, &store, options()).expect("deploy");
        assert!(report
            .entries
            .iter()
            .all(|entry| entry.status == StepStatus::Success));
        assert_eq!(client.calls().len(), 3 + 1 + 2 + 1);
    }

    #[test]
    fn force_re_runs_recorded_successes() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        deploy(&cluster, &registry, &MockClient::new(), &store, options()).expect("deploy");

        let client = MockClient::new();
        let mut opts = options();
        opts.force = true;
        let report = deploy(&cluster, &registry, &client, &store, opts).expect("deploy");
        assert_eq!(report.summary().skipped, 0);
        assert_eq!(client.calls().len(), 7);
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let client = MockClient::new();
        let token = CancellationToken::new();
        token.cancel();

        let report = Orchestrator::new(
            &cluster,
            &registry,
            &client,
            &store,
            SshCredentials::default(),
            options(),
        )
        .with_cancellation(token)
        .deploy()
        .expect("deploy");

        assert!(client.calls().is_empty());
        assert!(report.cancelled);
        assert!(report
            .entries
            .iter()
            .all(|entry| entry.status == StepStatus::Pending));
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn cancellation_mid_run_persists_finished_results() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let client = MockClient::new();
        let token = CancellationToken::new();
        let trigger = token.clone();

        let report = Orchestrator::new(
            &cluster,
            &registry,
            &client,
            &store,
            SshCredentials::default(),
            options(),
        )
        .with_cancellation(token)
        .with_progress_callback(move |entry| {
            if entry.step == "disable-firewall" {
                trigger.cancel();
            }
        })
        .deploy()
        .expect("deploy");

        assert!(report.cancelled);
        assert_eq!(client.count("10.0.0.1", "init-control-plane"), 0);
        let state = store.snapshot();
        let finished: Vec<_> = report
            .entries
            .iter()
            .filter(|entry| entry.status == StepStatus::Success)
            .collect();
        assert!(!finished.is_empty());
        for entry in finished {
            assert!(state.is_success(&entry.node, &entry.step));
        }
        assert_eq!(status(&report, "10.0.0.1", "install-lb"), Some(StepStatus::Pending));
    }

    #[test]
    fn cancel_during_retry_wait_leaves_the_pair_pending() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let token = CancellationToken::new();
        let client = MockClient {
            cancel_after: Some(("join-worker on 10.0.0.2".to_string(), token.clone())),
            ..MockClient::default()
        }
        .fail_times("10.0.0.2", "join-worker", Outcome::Exit(1), 1);
        let mut opts = options();
        opts.step_retries = 1;
        opts.step_retry_delay = Duration::from_secs(30);

        let started = Instant::now();
        let report = Orchestrator::new(
            &cluster,
            &registry,
            &client,
            &store,
            SshCredentials::default(),
            opts,
        )
        .with_cancellation(token)
        .deploy()
        .expect("deploy");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report.cancelled);
        assert_eq!(client.count("10.0.0.2", "join-worker"), 1);
        let entry = report.entry("10.0.0.2", "join-worker").expect("entry");
        assert_eq!(entry.status, StepStatus::Pending);
        assert_eq!(entry.blocked_by.as_deref(), Some("cancelled"));
        assert_eq!(report.summary().failed, 0);

        let state = store.snapshot();
        assert!(state.get("10.0.0.2", "join-worker").is_none());
        assert!(state.is_success("10.0.0.2", "disable-firewall"));
        assert!(state
            .nodes
            .values()
            .flat_map(|steps| steps.values())
            .all(|result| result.status != StepStatus::Running));
    }

    #[test]
    fn cancelled_retry_restores_the_earlier_failure() {
        let cluster = cluster();
        let registry = registry();
        let store = InMemoryStateStore::default();
        let failing = MockClient::new().fail("10.0.0.3", "join-worker", Outcome::Exit(1));
        deploy(&cluster, &registry, &failing, &store, options()).expect("deploy");
        let before = store
            .snapshot()
            .get("10.0.0.3", "join-worker")
            .cloned()
            .expect("recorded failure");

        let token = CancellationToken::new();
        let client = MockClient {
            cancel_after: Some(("join-worker on 10.0.0.3".to_string(), token.clone())),
            ..MockClient::default()
        }
        .fail_times("10.0.0.3", "join-worker", Outcome::Exit(1), 1);
        let mut opts = options();
        opts.step_retries = 1;
        opts.step_retry_delay = Duration::from_secs(30);
        let report = Orchestrator::new(
            &cluster,
            &registry,
            &client,
            &store,
            SshCredentials::default(),
            opts,
        )
        .with_cancellation(token)
        .deploy()
        .expect("deploy");

        assert_eq!(
            status(&report, "10.0.0.3", "join-worker"),
            Some(StepStatus::Pending)
        );
        assert_eq!(store.snapshot().get("10.0.0.3", "join-worker"), Some(&before));
    }

    #[test]
    fn concurrency_caps_simultaneous_sessions() {
        let nodes = (1..=6)
            .map(|index| {
                let role = if index == 1 { Role::Master } else { Role::Worker };
                node(&format!("10.0.0.{index}"), &format!("node-{index}"), role)
            })
            .collect();
        let cluster = cluster_with(nodes);
        let registry = StepRegistry::from_specs(&[spec("disable-firewall", RoleFilter::Any, &[], false)])
            .expect("registry");
        let store = InMemoryStateStore::default();
        let client = MockClient {
            delay: Duration::from_millis(20),
            ..MockClient::default()
        };
        let mut opts = options();
        opts.concurrency = 2;

        let report = deploy(&cluster, &registry, &client, &store, opts).expect("deploy");
        assert_eq!(report.exit_code(), 0);
        assert_eq!(client.calls().len(), 6);
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn cyclic_registry_fails_before_any_remote_call() {
        let cluster = cluster();
        let registry = StepRegistry::from_specs(&[
            spec("a", RoleFilter::Any, &["b"], false),
            spec("b", RoleFilter::Any, &["a"], false),
        ])
        .expect("registry");
        let client = MockClient::new();
        let store = InMemoryStateStore::default();
        let err = deploy(&cluster, &registry, &client, &store, options()).expect_err("config");
        assert!(matches!(err, ExecutionError::Config { .. }));
        assert!(client.calls().is_empty());
    }

    #[test]
    fn corrupted_state_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonFileStateStore::new(dir.path().to_path_buf());
        std::fs::write(store.state_path(), "{ not json").expect("write");
        let client = MockClient::new();
        let err = deploy(&cluster(), &registry(), &client, &store, options()).expect_err("corrupt");
        assert!(matches!(err, ExecutionError::StateCorruption { .. }));
        assert!(client.calls().is_empty());
        assert!(matches!(store.load(), Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn file_store_and_history_record_every_result() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonFileStateStore::new(dir.path().to_path_buf());
        let history = ResultHistory::new(dir.path().to_path_buf());
        let cluster = cluster();
        let registry = registry();
        let client = MockClient::new().fail("10.0.0.3", "join-worker", Outcome::Exit(1));

        let report = Orchestrator::new(
            &cluster,
            &registry,
            &client,
            &store,
            SshCredentials::default(),
            options(),
        )
        .with_history(&history)
        .deploy()
        .expect("deploy");

        assert_eq!(report.exit_code(), 2);
        assert_eq!(history.load().expect("history").len(), 7);
        let persisted = store.load().expect("load");
        assert_eq!(persisted.len(), 7);
        assert!(persisted
            .nodes
            .values()
            .flat_map(|steps| steps.values())
            .all(|result| result.status != StepStatus::Running));
    }

    #[test]
    fn cross_role_dependency_without_applicable_nodes_is_satisfied() {
        let cluster = cluster_with(vec![node("10.0.0.1", "master-1", Role::Master)]);
        let registry = registry();
        let store = InMemoryStateStore::default();
        let client = MockClient::new();
        let report = deploy(&cluster, &registry, &client, &store, options()).expect("deploy");
        assert_eq!(status(&report, "10.0.0.1", "install-lb"), Some(StepStatus::Success));
        assert_eq!(report.exit_code(), 0);
    }
}
