//! Credential environment for git subprocesses.

use std::path::PathBuf;

use crate::config::schema::{GitAuthSettings, GitAuthType};
use crate::error::SourceError;

/// Escapes a token for use inside a single-quoted shell string.
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Deletes the askpass script when dropped, so tokens never outlive the git call.
#[derive(Debug)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl AskpassCleanup {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn empty() -> Self {
        Self { path: None }
    }
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up askpass script: {}", e);
            }
        }
    }
}

/// Environment variables for one git invocation.
#[derive(Debug)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    /// Must outlive the git command.
    pub _cleanup: AskpassCleanup,
}

impl AuthEnv {
    fn plain(env_vars: Vec<(String, String)>) -> Self {
        Self {
            env_vars,
            _cleanup: AskpassCleanup::empty(),
        }
    }
}

/// Builds the environment that lets git authenticate without prompting.
pub fn build_auth_env(auth: &GitAuthSettings) -> Result<AuthEnv, SourceError> {
    let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];

    match auth.auth_type {
        GitAuthType::None => Ok(AuthEnv::plain(env)),
        GitAuthType::Token => {
            use secrecy::ExposeSecret;

            let token = auth.token.resolve().map_err(|e| {
                SourceError::AuthFailed(format!(
                    "Failed to resolve git token: {}. Configure token.value, token.file, or token.envVar.",
                    e
                ))
            })?;

            let path = std::env::temp_dir().join(format!(
                ".converge-askpass-{}.sh",
                uuid::Uuid::new_v4()
            ));
            let script = format!(
                "#!/bin/sh\necho '{}'\n",
                shell_escape_token(token.expose_secret())
            );
            write_script(&path, &script)
                .map_err(|e| SourceError::AuthFailed(format!("Failed to write askpass script: {}", e)))?;
            let cleanup = AskpassCleanup::new(path.clone());

            let path_str = path.to_str().ok_or_else(|| {
                SourceError::AuthFailed("Temp directory path contains non-UTF8 characters".to_string())
            })?;
            env.push(("GIT_ASKPASS".to_string(), path_str.to_string()));

            Ok(AuthEnv {
                env_vars: env,
                _cleanup: cleanup,
            })
        }
        GitAuthType::SshKey => {
            let key_path = if auth.ssh_key_path.is_empty() {
                crate::secrets::expand_home("~/.ssh/id_ed25519")
            } else {
                crate::secrets::expand_home(&auth.ssh_key_path)
            };

            if !key_path.exists() {
                return Err(SourceError::AuthFailed(format!(
                    "SSH key file not found: {}",
                    key_path.display()
                )));
            }

            let quoted = {
                let escaped = key_path.display().to_string().replace('\'', "'\\''");
                if escaped.starts_with('-') {
                    format!("'./{}'", escaped)
                } else {
                    format!("'{}'", escaped)
                }
            };
            env.push((
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i {} -o StrictHostKeyChecking=accept-new", quoted),
            ));
            Ok(AuthEnv::plain(env))
        }
    }
}

#[cfg(unix)]
fn write_script(path: &std::path::Path, script: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(path)?;
    file.write_all(script.as_bytes())
}

#[cfg(not(unix))]
fn write_script(path: &std::path::Path, script: &str) -> std::io::Result<()> {
    std::fs::write(path, script)
}
