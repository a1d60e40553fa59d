mod pool;

pub use pool::{SessionLease, SessionPool};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Supplied per run; never written anywhere by this crate.
    pub password: Option<String>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn connection_id(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    /// `ssh` binary to launch; resolved through `PATH` when relative.
    pub program: PathBuf,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Total connection attempts, including the first.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// ControlMaster socket directory; `None` disables multiplexing.
    pub control_dir: Option<PathBuf>,
    pub control_persist: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            control_dir: Some(std::env::temp_dir().join("kubengine-ssh")),
            control_persist: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SshCommandResult {
    /// The exit code is the only success signal; output text is never inspected.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshOutputStream {
    Stdout,
    Stderr,
}

/// Transport-level failures. A command that ran and exited non-zero is not an
/// error here; it comes back as an `SshCommandResult` with its exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    Connection { message: String },
    Timeout { message: String },
}

impl SshError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SshError::Connection { .. })
    }
}

impl std::fmt::Display for SshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshError::Connection { message } => write!(f, "ssh connection error: {message}"),
            SshError::Timeout { message } => write!(f, "ssh command timeout: {message}"),
        }
    }
}

impl std::error::Error for SshError {}

pub trait SshClient: Send + Sync {
    fn execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<SshCommandResult, SshError>;

    fn execute_streaming(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        let result = self.execute(target, command, timeout)?;
        for line in result.stdout.lines() {
            on_output(SshOutputStream::Stdout, line);
        }
        for line in result.stderr.lines() {
            on_output(SshOutputStream::Stderr, line);
        }
        Ok(result)
    }

    /// Tears down any multiplexed session kept for `target`.
    fn close(&self, _target: &SshTarget) {}
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Runs `operation` until it succeeds, fails with a non-connection error, or
/// `max_attempts` connection failures have been seen. Once `stopped` reports
/// true the last connection error is returned instead of another attempt.
pub fn retry_connection<T, F>(
    max_attempts: u32,
    base: Duration,
    max: Duration,
    stopped: impl Fn() -> bool,
    mut sleep: impl FnMut(Duration),
    mut operation: F,
) -> Result<T, SshError>
where
    F: FnMut(u32) -> Result<T, SshError>,
{
    let attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_connection() && attempt + 1 < attempts => {
                if stopped() {
                    debug!(attempt = attempt + 1, error = %err, "stop requested, not retrying ssh connection");
                    return Err(err);
                }
                let delay = backoff_delay(base, max, attempt);
                warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "ssh connection failed, retrying");
                sleep(delay);
                if stopped() {
                    return Err(err);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug)]
pub struct ProcessSshClient {
    config: SshConfig,
    stop: Option<Arc<AtomicBool>>,
}

impl ProcessSshClient {
    pub fn new() -> Self {
        Self::with_config(SshConfig::default())
    }

    pub fn with_config(config: SshConfig) -> Self {
        Self { config, stop: None }
    }

    /// Connection retries stop once `flag` is set. Commands already running
    /// are left alone.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Back-off sleep that wakes early when the stop flag is raised.
    fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        while !self.stopped() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep((until - now).min(POLL_INTERVAL));
        }
    }

    fn control_path(&self, target: &SshTarget) -> Option<PathBuf> {
        let base = self.config.control_dir.as_ref()?;
        if std::fs::create_dir_all(base).is_err() {
            return None;
        }
        Some(control_path_for_target(base, target))
    }

    /// Builds the `ssh` (or `sshpass -e ssh`) invocation without the remote
    /// command. The child leads its own process group so a terminal Ctrl-C
    /// reaches only this process.
    pub fn build_command(&self, target: &SshTarget, control: Option<&Path>) -> Command {
        let mut cmd = if target.password.is_some() {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e").arg(&self.config.program);
            cmd
        } else {
            let mut cmd = Command::new(&self.config.program);
            cmd.arg("-o").arg("BatchMode=yes");
            cmd
        };
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if let Some(password) = target.password.as_ref() {
            cmd.env("SSHPASS", password);
        }
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(target.port.to_string());
        if let Some(identity) = target.identity_file.as_ref() {
            cmd.arg("-i").arg(identity);
        }
        if let Some(path) = control.and_then(Path::to_str) {
            cmd.arg("-o")
                .arg("ControlMaster=auto")
                .arg("-o")
                .arg(format!(
                    "ControlPersist={}s",
                    self.config.control_persist.as_secs()
                ))
                .arg("-o")
                .arg(format!("ControlPath={path}"));
        }
        cmd
    }

    fn try_execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        let control = self.control_path(target);
        let mut cmd = self.build_command(target, control.as_deref());
        cmd.arg(target.destination()).arg(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            let message = if err.kind() == std::io::ErrorKind::NotFound {
                if target.password.is_some() {
                    "sshpass is not installed; install it or use key authentication".to_string()
                } else {
                    "ssh client binary not found".to_string()
                }
            } else {
                format!("failed to launch ssh: {err}")
            };
            SshError::Connection { message }
        })?;

        let (tx, rx) = mpsc::channel::<(SshOutputStream, String)>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    let _ = tx.send((SshOutputStream::Stdout, line));
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    let _ = tx.send((SshOutputStream::Stderr, line));
                }
            }));
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(kill_on_timeout(&mut child, timeout));
            }
            match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok((kind, line)) => {
                    on_output(kind, &line);
                    let buf = match kind {
                        SshOutputStream::Stdout => &mut stdout_buf,
                        SshOutputStream::Stderr => &mut stderr_buf,
                    };
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = wait_until(&mut child, deadline).map_err(|err| match err {
            WaitError::Deadline => kill_on_timeout(&mut child, timeout),
            WaitError::Io(err) => SshError::Connection {
                message: format!("failed to wait on ssh process: {err}"),
            },
        })?;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == 255 {
            let message = if stderr_buf.trim().is_empty() {
                "ssh connection failed".to_string()
            } else {
                stderr_buf.trim().to_string()
            };
            return Err(SshError::Connection { message });
        }

        Ok(SshCommandResult {
            stdout: stdout_buf,
            stderr: stderr_buf,
            exit_code,
        })
    }
}

impl Default for ProcessSshClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SshClient for ProcessSshClient {
    fn execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<SshCommandResult, SshError> {
        self.execute_streaming(target, command, timeout, &mut |_, _| {})
    }

    fn execute_streaming(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        debug!(host = %target.host, command, "ssh exec");
        retry_connection(
            self.config.max_retries,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
            || self.stopped(),
            |delay| self.pause(delay),
            |_| self.try_execute(target, command, timeout, on_output),
        )
    }

    fn close(&self, target: &SshTarget) {
        let Some(path) = self.control_path(target) else {
            return;
        };
        if !path.exists() {
            return;
        }
        let mut cmd = self.build_command(target, Some(&path));
        cmd.arg("-O").arg("exit").arg(target.destination());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(err) = cmd.status() {
            debug!(host = %target.host, error = %err, "failed to close ssh control master");
        }
    }
}

fn control_path_for_target(base_dir: &Path, target: &SshTarget) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    target.connection_id().hash(&mut hasher);
    base_dir.join(format!("kubengine-{:x}", hasher.finish()))
}

enum WaitError {
    Deadline,
    Io(std::io::Error),
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<ExitStatus, WaitError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => return Err(WaitError::Deadline),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => return Err(WaitError::Io(err)),
        }
    }
}

fn kill_on_timeout(child: &mut Child, timeout: Duration) -> SshError {
    let _ = child.kill();
    let _ = child.wait();
    SshError::Timeout {
        message: format!("command did not finish within {}s", timeout.as_secs()),
    }
}
