//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `kiln.toml`, environment variables, and CLI flags
//! in that order of precedence.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{ContainerSpec, VmId};

/// Number of create attempts made when the identifier is allocated for us.
pub const DEFAULT_CREATE_ATTEMPTS: u32 = 3;

/// Proxmox connection settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PROXMOX",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct ProxmoxConfig {
    /// API endpoint, for example `https://pve.example.com:8006/api2/json`.
    pub url: String,
    /// User (`root@pam`) or token owner (`ci@pve!kiln`).
    pub username: String,
    /// Password used for ticket login when no token is configured.
    pub password: Option<String>,
    /// API token secret. Takes precedence over the password.
    pub token: Option<String>,
    /// Node that hosts the build container.
    pub node: String,
    /// Accept self-signed certificates.
    #[ortho_config(default = false)]
    pub skip_cert_validation: bool,
    /// Upper bound, in seconds, for waiting on a hypervisor task.
    #[ortho_config(default = 60)]
    pub task_timeout_secs: u64,
}

/// Container settings for the build.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN_CT",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct ContainerConfig {
    /// Explicit container identifier; `0` lets the hypervisor pick one.
    #[ortho_config(default = 0)]
    pub vmid: u32,
    /// Resource pool for the container.
    pub pool: Option<String>,
    /// Hostname; defaults to `kiln-<random>`.
    pub hostname: Option<String>,
    /// OS template volume the container is created from.
    pub os_template: String,
    /// CPU cores.
    pub cores: Option<u32>,
    /// Memory in megabytes.
    pub memory: Option<u32>,
    /// Swap in megabytes.
    pub swap: Option<u32>,
    /// Storage for the root filesystem.
    pub storage: Option<String>,
    /// Root filesystem size in gigabytes.
    pub disk_size_gb: Option<u32>,
    /// First network interface.
    #[ortho_config(default = "name=eth0,bridge=vmbr0,ip=dhcp".to_owned())]
    pub network: String,
    /// Root password.
    pub password: Option<String>,
    /// Public keys authorised for root.
    pub ssh_public_keys: Option<String>,
    /// Run the container unprivileged.
    #[ortho_config(default = false)]
    pub unprivileged: bool,
    /// Start the container on node boot.
    #[ortho_config(default = false)]
    pub onboot: bool,
    /// Start the container once created.
    #[ortho_config(default = true)]
    pub start: bool,
    /// Comma separated tags.
    pub tags: Option<String>,
    /// Description stored on the template.
    pub description: Option<String>,
    /// DNS server.
    pub nameserver: Option<String>,
    /// DNS search domain.
    pub searchdomain: Option<String>,
    /// Create attempts when the identifier is allocated by the hypervisor.
    #[ortho_config(default = DEFAULT_CREATE_ATTEMPTS)]
    pub create_attempts: u32,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in kiln.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ProxmoxConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the task timeout as a [`Duration`].
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Returns the token secret when token authentication is configured.
    #[must_use]
    pub fn token_secret(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty and
    /// [`ConfigError::Invalid`] when neither a token nor a password is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.url,
            &FieldMetadata::new("Proxmox API URL", "PROXMOX_URL", "url", "proxmox"),
        )?;
        require_field(
            &self.username,
            &FieldMetadata::new("Proxmox username", "PROXMOX_USERNAME", "username", "proxmox"),
        )?;
        require_field(
            &self.node,
            &FieldMetadata::new("Proxmox node", "PROXMOX_NODE", "node", "proxmox"),
        )?;
        let has_password = self
            .password
            .as_deref()
            .is_some_and(|password| !password.is_empty());
        if self.token_secret().is_none() && !has_password {
            return Err(ConfigError::Invalid(String::from(
                "either PROXMOX_TOKEN or PROXMOX_PASSWORD must be set",
            )));
        }
        if self.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "task_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }
}

impl ContainerConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the configured identifier (unset when `0`).
    #[must_use]
    pub const fn vm_id(&self) -> VmId {
        VmId::new(self.vmid)
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty or the retry
    /// budget is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.os_template,
            &FieldMetadata::new(
                "OS template",
                "KILN_CT_OS_TEMPLATE",
                "os_template",
                "container",
            ),
        )?;
        if self.create_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "create_attempts must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Builds a [`ContainerSpec`] from the configured values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_spec(&self) -> Result<ContainerSpec, ConfigError> {
        self.validate()?;
        let hostname = self
            .hostname
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("kiln-{}", Uuid::new_v4().simple()));
        let tags = self
            .tags
            .as_deref()
            .map(|raw| raw.split(',').map(str::to_owned).collect())
            .unwrap_or_default();

        ContainerSpec::builder()
            .hostname(hostname)
            .os_template(&self.os_template)
            .cores(self.cores)
            .memory_mb(self.memory)
            .swap_mb(self.swap)
            .rootfs(self.storage.clone(), self.disk_size_gb)
            .network(Some(self.network.clone()))
            .password(self.password.clone())
            .ssh_public_keys(self.ssh_public_keys.clone())
            .unprivileged(self.unprivileged)
            .onboot(self.onboot)
            .start(self.start)
            .pool(self.pool.clone())
            .tags(tags)
            .description(self.description.clone())
            .nameserver(self.nameserver.clone())
            .searchdomain(self.searchdomain.clone())
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
