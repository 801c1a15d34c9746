//! SSH connection settings and session errors.
//!
//! [`SshConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files and `KILN_SSH_*` environment variables.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::expand_tilde;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH settings used to reach the build container.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN_SSH",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Address of the container. Required before a session can be opened.
    pub host: Option<String>,
    /// SSH port.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub port: u16,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub user: String,
    /// Private key file; supports a leading `~/`.
    pub identity_file: Option<String>,
    /// Force batch mode so ssh never prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Enforce host key checking. Build containers get fresh keys, so this
    /// is off by default.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds to wait for the container to accept a session.
    #[ortho_config(default = 300)]
    pub timeout_secs: u64,
    /// Seconds between connection attempts.
    #[ortho_config(default = 2)]
    pub poll_interval_secs: u64,
}

/// Where a session is opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionTarget {
    /// Hostname or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Remote user.
    pub user: String,
}

impl SshConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] naming the loader failure when
    /// the merge fails.
    pub fn load_without_cli_args() -> Result<Self, SessionError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")]).map_err(|err| {
            SessionError::InvalidConfig {
                field: format!("ssh ({err})"),
            }
        })
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when a field is empty or a
    /// duration is zero.
    pub fn validate(&self) -> Result<(), SessionError> {
        require(&self.ssh_bin, "ssh_bin")?;
        require(&self.user, "user")?;
        if let Some(identity) = self.identity_file.as_deref() {
            require(identity, "identity_file")?;
        }
        if self.timeout_secs == 0 {
            return Err(SessionError::InvalidConfig {
                field: String::from("timeout_secs"),
            });
        }
        Ok(())
    }

    /// Returns the session target, failing when no host is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoHost`] when the host is missing or blank.
    pub fn target(&self) -> Result<SessionTarget, SessionError> {
        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or(SessionError::NoHost)?;
        Ok(SessionTarget {
            host: host.to_owned(),
            port: self.port,
            user: self.user.clone(),
        })
    }

    /// Returns the overall connection timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the delay between connection attempts.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Returns the identity file with a leading `~/` resolved against `HOME`.
    ///
    /// Without `HOME` the path is returned unchanged.
    #[must_use]
    pub fn identity_path(&self) -> Option<String> {
        self.identity_file.as_deref().map(expand_tilde)
    }
}

fn require(value: &str, field: &str) -> Result<(), SessionError> {
    if value.trim().is_empty() {
        return Err(SessionError::InvalidConfig {
            field: field.to_owned(),
        });
    }
    Ok(())
}

/// Errors surfaced while opening or using a remote session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when no host is configured for the session.
    #[error("no host set: set KILN_SSH_HOST or add host to [ssh] in kiln.toml")]
    NoHost,
    /// Raised when configuration is missing required values.
    #[error("missing {field}: set KILN_SSH_{env_suffix} or add {field} to [ssh] in kiln.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the target never accepted a connection.
    #[error("timeout waiting for ssh on {host}:{port}")]
    Timeout {
        /// Host that was polled.
        host: String,
        /// Port that was polled.
        port: u16,
    },
    /// Raised when the run was cancelled while waiting.
    #[error("cancelled while connecting to {host}")]
    Cancelled {
        /// Host that was being polled.
        host: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the port accepted connections but ssh never opened a
    /// shell before the deadline.
    #[error("ssh handshake with {host} failed with status {status_text}: {stderr}")]
    HandshakeFailed {
        /// Host that was contacted.
        host: String,
        /// Exit status of the last attempt.
        status_text: String,
        /// Stderr of the last attempt.
        stderr: String,
    },
}
