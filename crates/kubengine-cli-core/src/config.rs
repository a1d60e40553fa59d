use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use kubengine_executor::DeployOptions;
use kubengine_ssh::SshConfig;
use serde::{Deserialize, Serialize};

use crate::CliError;

pub const HOME_ENV: &str = "KUBENGINE_HOME";
pub const SETTINGS_FILE: &str = "settings.json";

/// Run-wide tunables read from `<home>/settings.json`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub concurrency: usize,
    pub step_retries: u32,
    pub step_retry_delay_secs: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connect_retries: u32,
    pub retry_base_delay_millis: u64,
    pub ssh_user: String,
    pub ssh_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    pub deploy_src: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            step_retries: 1,
            step_retry_delay_secs: 5,
            command_timeout_secs: 600,
            connect_timeout_secs: 10,
            connect_retries: 3,
            retry_base_delay_millis: 500,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            identity_file: None,
            deploy_src: "/root/offline-deploy".to_string(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), CliError> {
        if self.concurrency == 0 {
            return Err(CliError::Config("concurrency must be at least 1".to_string()));
        }
        if self.command_timeout_secs == 0 {
            return Err(CliError::Config(
                "commandTimeoutSecs must be at least 1".to_string(),
            ));
        }
        if self.ssh_user.trim().is_empty() {
            return Err(CliError::Config("sshUser must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            max_retries: self.connect_retries.max(1),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_millis),
            ..SshConfig::default()
        }
    }

    pub fn deploy_options(&self, deploy_src: &str, force: bool) -> DeployOptions {
        DeployOptions {
            concurrency: self.concurrency,
            step_retries: self.step_retries,
            step_retry_delay: Duration::from_secs(self.step_retry_delay_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            force,
            deploy_src: deploy_src.to_string(),
        }
    }
}

fn resolve_home_dir() -> Result<PathBuf, CliError> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .map_err(|_| CliError::Config("home directory not found".to_string()))
}

/// Expands `~/` and anchors relative paths at the working directory.
pub fn normalize_path(value: &str) -> Result<PathBuf, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CliError::Config("path is empty".to_string()));
    }
    let mut path = match trimmed.strip_prefix("~/") {
        Some(rest) => resolve_home_dir()?.join(rest),
        None => PathBuf::from(trimmed),
    };
    if path.is_relative() {
        path = env::current_dir()?.join(path);
    }
    Ok(path)
}

/// `--home`, then `KUBENGINE_HOME`, then `~/.kubengine`.
pub fn kubengine_home(override_dir: Option<&Path>) -> Result<PathBuf, CliError> {
    if let Some(dir) = override_dir {
        return normalize_path(&dir.to_string_lossy());
    }
    if let Ok(custom) = env::var(HOME_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return normalize_path(trimmed);
        }
    }
    Ok(resolve_home_dir()?.join(".kubengine"))
}

pub fn ensure_home_dir(override_dir: Option<&Path>) -> Result<PathBuf, CliError> {
    let path = kubengine_home(override_dir)?;
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub fn settings_path(home: &Path) -> PathBuf {
    home.join(SETTINGS_FILE)
}

pub fn load_settings(home: &Path) -> Result<Settings, CliError> {
    let path = settings_path(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(&path)?;
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings = serde_json::from_str(&content).map_err(|err| {
        CliError::Config(format!("failed to parse {}: {err}", path.display()))
    })?;
    settings.validate()?;
    Ok(settings)
}
