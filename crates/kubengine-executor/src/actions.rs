//! Remote actions behind each deployment step.
//!
//! Every script here is written so that running it again on a node where it
//! already succeeded changes nothing.

use std::fmt;
use std::sync::Arc;

use kubengine_core_domain::{ClusterConfig, Node};
use kubengine_ssh::{SshCommandResult, SshError};

const KUBERNETES_VERSION: &str = "v1.34.0";
const CNI_DIR: &str = "/opt/cni/bin";
const CONTAINERD_DIR: &str = "/opt/containerd";
const MANIFEST_DIR: &str = "/etc/kubengine/manifests";
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
const REPO_NAME: &str = "kubengine_repo";

/// Inputs every action sees for one (node, step) pair.
pub struct StepContext<'a> {
    pub node: &'a Node,
    pub cluster: &'a ClusterConfig,
    pub deploy_src: &'a str,
}

impl StepContext<'_> {
    pub fn master(&self) -> Result<&Node, ActionError> {
        self.cluster
            .primary_master()
            .ok_or_else(|| ActionError::Invalid {
                message: "cluster has no master node".to_string(),
            })
    }

    fn bundle_path(&self, relative: &str) -> String {
        format!("{}/{}", self.deploy_src.trim_end_matches('/'), relative)
    }

    /// Shell fragment writing a bundle file to stdout. Workers pull it from
    /// the master over sftp; masters read the local copy.
    fn read_bundle(&self, relative: &str) -> Result<String, ActionError> {
        let path = self.bundle_path(relative);
        if self.node.is_master() {
            Ok(format!("cat {path}"))
        } else {
            let master = self.master()?;
            Ok(format!("curl -fsS sftp://{}{path} -o -", master.address))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    Connection { message: String },
    Timeout { message: String },
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    Invalid { message: String },
}

impl ActionError {
    /// Eligible for a step-level retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Command { .. } | ActionError::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ActionError::Connection { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ActionError::Command { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::Connection { message } => write!(f, "connection error: {message}"),
            ActionError::Timeout { message } => write!(f, "timeout: {message}"),
            ActionError::Command {
                command,
                exit_code,
                stderr,
            } => {
                let first_line = command.lines().next().unwrap_or_default();
                write!(f, "`{first_line}` exited with {exit_code}")?;
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            ActionError::Invalid { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl From<SshError> for ActionError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Connection { message } => ActionError::Connection { message },
            SshError::Timeout { message } => ActionError::Timeout { message },
        }
    }
}

/// Runs a command on a node. Implementations own session handling.
pub trait CommandRunner {
    fn run(&mut self, node: &Node, command: &str) -> Result<SshCommandResult, ActionError>;

    /// Like `run`, but a non-zero exit becomes `ActionError::Command`.
    fn run_checked(&mut self, node: &Node, command: &str) -> Result<SshCommandResult, ActionError> {
        let result = self.run(node, command)?;
        if result.success() {
            Ok(result)
        } else {
            Err(ActionError::Command {
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }
}

pub trait StepAction: Send + Sync {
    fn key(&self) -> &str;
    fn run(&self, ctx: &StepContext<'_>, runner: &mut dyn CommandRunner) -> Result<(), ActionError>;
}

type ScriptFn = fn(&StepContext<'_>) -> Result<Vec<String>, ActionError>;

/// A fixed list of commands run in order on the step's node.
struct ScriptAction {
    key: &'static str,
    script: ScriptFn,
}

impl StepAction for ScriptAction {
    fn key(&self) -> &str {
        self.key
    }

    fn run(&self, ctx: &StepContext<'_>, runner: &mut dyn CommandRunner) -> Result<(), ActionError> {
        for command in (self.script)(ctx)? {
            runner.run_checked(ctx.node, &command)?;
        }
        Ok(())
    }
}

struct JoinWorkerAction;

impl StepAction for JoinWorkerAction {
    fn key(&self) -> &str {
        "join-worker"
    }

    fn run(&self, ctx: &StepContext<'_>, runner: &mut dyn CommandRunner) -> Result<(), ActionError> {
        let joined = runner.run(ctx.node, "test -f /etc/kubernetes/kubelet.conf")?;
        if joined.success() {
            return Ok(());
        }
        let master = ctx.master()?;
        let token = runner.run_checked(master, "kubeadm token create --print-join-command")?;
        let join_command = token.stdout.trim();
        if !join_command.starts_with("kubeadm join") {
            return Err(ActionError::Invalid {
                message: format!(
                    "master {} returned an unexpected join command: {join_command:?}",
                    master.address
                ),
            });
        }
        runner.run_checked(ctx.node, join_command)?;
        Ok(())
    }
}

/// User-declared commands with `{placeholder}` substitution.
pub struct ShellAction {
    commands: Vec<String>,
}

impl ShellAction {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

impl StepAction for ShellAction {
    fn key(&self) -> &str {
        "shell"
    }

    fn run(&self, ctx: &StepContext<'_>, runner: &mut dyn CommandRunner) -> Result<(), ActionError> {
        for template in &self.commands {
            let command = render_placeholders(template, ctx)?;
            runner.run_checked(ctx.node, &command)?;
        }
        Ok(())
    }
}

pub fn render_placeholders(template: &str, ctx: &StepContext<'_>) -> Result<String, ActionError> {
    let master = ctx.master()?;
    Ok(template
        .replace("{address}", &ctx.node.address)
        .replace("{hostname}", &ctx.node.hostname)
        .replace("{master}", &master.address)
        .replace("{deploy_src}", ctx.deploy_src)
        .replace("{pod_cidr}", &ctx.cluster.pod_cidr.to_string())
        .replace("{service_cidr}", &ctx.cluster.service_cidr.to_string())
        .replace("{domain}", &ctx.cluster.domain))
}

const SCRIPTS: &[(&str, ScriptFn)] = &[
    ("disable-firewall", disable_firewall),
    ("set-hostname", set_hostname),
    ("install-cni", install_cni),
    ("install-containerd", install_containerd),
    ("install-kubernetes", install_kubernetes),
    ("init-control-plane", init_control_plane),
    ("install-calico", install_calico),
    ("install-helm", install_helm),
    ("install-lb", install_lb),
];

/// Keys accepted in a step's `action` field.
pub fn action_keys() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = SCRIPTS.iter().map(|(key, _)| *key).collect();
    keys.push("join-worker");
    keys.push("shell");
    keys
}

/// Static catalog lookup. `shell` is built separately because it carries commands.
pub fn builtin_action(key: &str) -> Option<Arc<dyn StepAction>> {
    if key == "join-worker" {
        return Some(Arc::new(JoinWorkerAction));
    }
    SCRIPTS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(name, script)| {
            Arc::new(ScriptAction {
                key: *name,
                script: *script,
            }) as Arc<dyn StepAction>
        })
}

fn disable_firewall(_ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    Ok(vec![
        "if systemctl list-unit-files firewalld.service >/dev/null 2>&1; then systemctl disable --now firewalld; fi".to_string(),
        "swapoff -a".to_string(),
        "sed -i '/\\sswap\\s/s/^[^#]/#&/' /etc/fstab".to_string(),
    ])
}

fn set_hostname(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let mut commands = vec![format!("hostnamectl set-hostname {}", ctx.node.hostname)];
    for node in &ctx.cluster.nodes {
        let pattern = node.address.replace('.', "\\.");
        commands.push(format!(
            "if grep -qE '^{pattern}[[:space:]]' /etc/hosts; then sed -i -E 's/^{pattern}[[:space:]].*/{} {}/' /etc/hosts; else echo '{} {}' >> /etc/hosts; fi",
            node.address, node.hostname, node.address, node.hostname
        ));
    }
    Ok(commands)
}

fn install_cni(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let source = ctx.read_bundle("cni-plugins-linux-amd64-v1.7.1.tgz")?;
    Ok(vec![
        format!("mkdir -p {CNI_DIR} /etc/cni/net.d"),
        format!("test -x {CNI_DIR}/bridge || {source} | tar zxf - -C {CNI_DIR}"),
    ])
}

fn install_containerd(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let archive = ctx.read_bundle("containerd/containerd-2.1.3-linux-amd64.tar.gz")?;
    let runc = ctx.read_bundle("containerd/runc.amd64")?;
    let config = ctx.read_bundle("containerd/config.toml")?;
    Ok(vec![
        "if rpm -q containerd >/dev/null 2>&1; then yum remove -y containerd; fi".to_string(),
        format!("mkdir -p {CONTAINERD_DIR} /etc/containerd"),
        format!(
            "test -x {CONTAINERD_DIR}/bin/containerd || {archive} | tar zxf - -C {CONTAINERD_DIR}"
        ),
        format!("ln -sf {CONTAINERD_DIR}/bin/containerd-shim-runc-v2 /usr/local/bin/containerd-shim-runc-v2"),
        format!("ln -sf {CONTAINERD_DIR}/bin/ctr /usr/local/bin/ctr"),
        format!("test -x /usr/local/bin/runc || ({runc} > /usr/local/bin/runc && chmod 755 /usr/local/bin/runc)"),
        format!("{config} > /etc/containerd/config.toml"),
        format!(
            "cat > /usr/lib/systemd/system/containerd.service <<'EOF'\n\
             [Unit]\n\
             Description=containerd container runtime\n\
             Documentation=https://containerd.io\n\
             After=network.target\n\
             \n\
             [Service]\n\
             ExecStartPre=/sbin/modprobe overlay\n\
             ExecStart={CONTAINERD_DIR}/bin/containerd\n\
             Delegate=yes\n\
             KillMode=process\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n\
             EOF"
        ),
        "systemctl daemon-reload && systemctl enable --now containerd".to_string(),
    ])
}

fn install_kubernetes(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let baseurl = if ctx.node.is_master() {
        format!("file://{}", ctx.bundle_path("repo"))
    } else {
        format!("sftp://{}{}", ctx.master()?.address, ctx.bundle_path("repo"))
    };
    let images = ctx.read_bundle("images/kubenetes.images.v1.34.0.tar.gz")?;
    let mut commands = vec![
        format!(
            "cat > /etc/yum.repos.d/{REPO_NAME}.repo <<'EOF'\n\
             [{REPO_NAME}]\n\
             name={REPO_NAME}\n\
             baseurl={baseurl}\n\
             gpgcheck=0\n\
             enabled=1\n\
             EOF"
        ),
        format!(
            "rpm -q kubelet kubectl kubeadm >/dev/null 2>&1 || yum install -y --disablerepo='*' --enablerepo={REPO_NAME} kubelet kubectl kubeadm"
        ),
        format!("rm -f /etc/yum.repos.d/{REPO_NAME}.repo"),
        "systemctl enable kubelet".to_string(),
        "cat > /etc/crictl.yaml <<'EOF'\n\
         runtime-endpoint: unix:///var/run/containerd/containerd.sock\n\
         image-endpoint: unix:///var/run/containerd/containerd.sock\n\
         timeout: 10\n\
         debug: false\n\
         EOF"
            .to_string(),
        format!(
            "ctr -n k8s.io i ls -q | grep -q kube-apiserver:{KUBERNETES_VERSION} || {images} | ctr -n k8s.io i import -"
        ),
    ];
    for nameserver in &ctx.cluster.nameservers {
        commands.push(ensure_line("/etc/resolv.conf", &format!("nameserver {nameserver}")));
    }
    commands.push(ensure_line("/etc/resolv.conf", "options timeout:2 attempts:1"));
    commands.push("echo 1 > /proc/sys/net/ipv4/ip_forward".to_string());
    Ok(commands)
}

fn init_control_plane(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let master = ctx.master()?;
    let mut commands = vec![
        format!(
            "test -f {ADMIN_KUBECONFIG} || kubeadm init --apiserver-advertise-address={} --control-plane-endpoint={} --kubernetes-version={KUBERNETES_VERSION} --service-cidr={} --pod-network-cidr={} --service-dns-domain={} --ignore-preflight-errors=all",
            ctx.node.address,
            master.address,
            ctx.cluster.service_cidr,
            ctx.cluster.pod_cidr,
            ctx.cluster.domain,
        ),
        ensure_line("/etc/profile", &format!("export KUBECONFIG={ADMIN_KUBECONFIG}")),
    ];
    if ctx.node.schedulable {
        commands.push(format!(
            "KUBECONFIG={ADMIN_KUBECONFIG} kubectl taint nodes {} node-role.kubernetes.io/control-plane:NoSchedule- || true",
            ctx.node.hostname
        ));
    }
    Ok(commands)
}

fn install_calico(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let images = ctx.read_bundle("images/calico.images.v3.27.0.tar.gz")?;
    let template = ctx.bundle_path("templates/calico.yaml.j2");
    let cidr = ctx.cluster.pod_cidr.to_string();
    Ok(vec![
        format!("{images} | ctr -n k8s.io i import -"),
        format!("mkdir -p {MANIFEST_DIR}"),
        format!(
            "sed -E 's#\\{{\\{{ *pod_network_cidr *\\}}\\}}#{cidr}#g' {template} > {MANIFEST_DIR}/calico.yaml"
        ),
        format!("KUBECONFIG={ADMIN_KUBECONFIG} kubectl apply -f {MANIFEST_DIR}/calico.yaml"),
    ])
}

fn install_helm(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    Ok(vec![format!(
        "install -m 755 -o root -g root {} /usr/local/bin/helm",
        ctx.bundle_path("helm")
    )])
}

fn install_lb(ctx: &StepContext<'_>) -> Result<Vec<String>, ActionError> {
    let images = ctx.read_bundle("images/metallb.images.v0.15.2.tar.gz")?;
    let chart = ctx.bundle_path("charts/metallb");
    let manifest = render_ip_pool_manifest(ctx.cluster);
    Ok(vec![
        format!("{images} | ctr -n k8s.io i import -"),
        format!(
            "export KUBECONFIG={ADMIN_KUBECONFIG}; helm status metallb -n metallb-system >/dev/null 2>&1 || helm install metallb {chart} -n metallb-system --create-namespace -f {chart}/values.yaml --wait --timeout 5m"
        ),
        format!("mkdir -p {MANIFEST_DIR}"),
        format!("cat > {MANIFEST_DIR}/metallb-ippool.yaml <<'EOF'\n{manifest}EOF"),
        format!("KUBECONFIG={ADMIN_KUBECONFIG} kubectl apply -f {MANIFEST_DIR}/metallb-ippool.yaml"),
    ])
}

/// MetalLB address pool plus an L2 advertisement covering every LB range.
pub fn render_ip_pool_manifest(cluster: &ClusterConfig) -> String {
    let mut manifest = String::from(
        "apiVersion: metallb.io/v1beta1\n\
         kind: IPAddressPool\n\
         metadata:\n  name: default-pool\n  namespace: metallb-system\n\
         spec:\n  addresses:\n",
    );
    for range in &cluster.lb_ip_ranges {
        if range.start == range.end {
            manifest.push_str(&format!("    - {}/32\n", range.start));
        } else {
            manifest.push_str(&format!("    - {range}\n"));
        }
    }
    manifest.push_str(
        "---\n\
         apiVersion: metallb.io/v1beta1\n\
         kind: L2Advertisement\n\
         metadata:\n  name: default-l2\n  namespace: metallb-system\n\
         spec:\n  ipAddressPools:\n    - default-pool\n",
    );
    manifest
}

fn ensure_line(path: &str, line: &str) -> String {
    format!("grep -qxF '{line}' {path} || echo '{line}' >> {path}")
}
