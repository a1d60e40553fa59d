use std::env;

use kubengine_executor::SshCredentials;

use crate::config::{normalize_path, Settings};
use crate::CliError;

pub const DEFAULT_PASSWORD_ENV: &str = "KUBENGINE_SSH_PASSWORD";

/// Per-run overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct CredentialArgs {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub password_env: Option<String>,
}

/// Builds SSH credentials for this run. The password is read from the
/// environment only and is never written anywhere.
pub fn resolve_credentials(
    settings: &Settings,
    args: &CredentialArgs,
) -> Result<SshCredentials, CliError> {
    let user = args
        .user
        .clone()
        .unwrap_or_else(|| settings.ssh_user.clone());
    if user.trim().is_empty() {
        return Err(CliError::InvalidInput("ssh user must not be empty".to_string()));
    }

    let identity_file = match args.identity_file.as_ref().or(settings.identity_file.as_ref()) {
        Some(value) => {
            let path = normalize_path(value)?;
            if !path.is_file() {
                return Err(CliError::Config(format!(
                    "identity file {} does not exist",
                    path.display()
                )));
            }
            Some(path)
        }
        None => None,
    };

    let password_env = args
        .password_env
        .as_deref()
        .unwrap_or(DEFAULT_PASSWORD_ENV);
    let password = env::var(password_env)
        .ok()
        .filter(|value| !value.is_empty());

    Ok(SshCredentials {
        user: user.trim().to_string(),
        port: args.port.unwrap_or(settings.ssh_port),
        identity_file,
        password,
    })
}
