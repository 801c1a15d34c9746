//! Backend abstraction for the remote hypervisor that hosts build containers.
//!
//! Steps only talk to the hypervisor through [`Backend`], so the Proxmox
//! client can be swapped for scripted doubles in tests.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Numeric identifier of a container or template on the hypervisor.
///
/// Zero means "not configured"; the hypervisor never hands it out.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VmId(u32);

impl VmId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns `true` when no identifier was configured.
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for VmId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names a remote resource across its lifecycle (container, then template).
///
/// A reference is never mutated; a retry builds a fresh one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmRef {
    /// Hypervisor identifier.
    pub id: VmId,
    /// Node hosting the resource.
    pub node: String,
    /// Resource pool the resource was assigned to, if any.
    pub pool: Option<String>,
}

impl VmRef {
    /// Creates a reference on `node` without pool assignment.
    #[must_use]
    pub fn new(id: VmId, node: impl Into<String>) -> Self {
        Self {
            id,
            node: node.into(),
            pool: None,
        }
    }

    /// Assigns the reference to a resource pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Option<String>) -> Self {
        self.pool = pool;
        self
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on node {}", self.id, self.node)
    }
}

/// Parameters used to create a container.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContainerSpec {
    /// Hostname set inside the container.
    pub hostname: String,
    /// Volume identifier of the OS template archive (for example
    /// `local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst`).
    pub os_template: String,
    /// Number of CPU cores.
    pub cores: Option<u32>,
    /// Memory in megabytes.
    pub memory_mb: Option<u32>,
    /// Swap in megabytes.
    pub swap_mb: Option<u32>,
    /// Storage backing the root filesystem.
    pub storage: Option<String>,
    /// Root filesystem size in gigabytes.
    pub disk_size_gb: Option<u32>,
    /// Network interface definition in hypervisor syntax.
    pub network: Option<String>,
    /// Root password.
    pub password: Option<String>,
    /// Public keys authorised for root.
    pub ssh_public_keys: Option<String>,
    /// Whether the container runs unprivileged.
    pub unprivileged: bool,
    /// Whether the container starts on node boot.
    pub onboot: bool,
    /// Whether the container is started after creation.
    pub start: bool,
    /// Resource pool assignment.
    pub pool: Option<String>,
    /// Tags attached to the container.
    pub tags: Vec<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// DNS server.
    pub nameserver: Option<String>,
    /// DNS search domain.
    pub searchdomain: Option<String>,
}

impl ContainerSpec {
    /// Starts a builder for a [`ContainerSpec`].
    #[must_use]
    pub fn builder() -> ContainerSpecBuilder {
        ContainerSpecBuilder::default()
    }

    /// Validates the spec, returning the first missing or invalid field.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required string is empty
    /// and [`BackendError::InvalidValue`] when a size is zero.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.hostname.is_empty() {
            return Err(BackendError::Validation("hostname".to_owned()));
        }
        if self.os_template.is_empty() {
            return Err(BackendError::Validation("os_template".to_owned()));
        }
        for (field, value) in [
            ("cores", self.cores),
            ("memory_mb", self.memory_mb),
            ("disk_size_gb", self.disk_size_gb),
        ] {
            if value == Some(0) {
                return Err(BackendError::InvalidValue {
                    field: field.to_owned(),
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }
        if self.disk_size_gb.is_some() && self.storage.is_none() {
            return Err(BackendError::InvalidValue {
                field: "disk_size_gb".to_owned(),
                reason: "requires storage to be set".to_owned(),
            });
        }
        Ok(())
    }

    /// Renders the root filesystem definition (`storage:size`), if any.
    #[must_use]
    pub fn rootfs(&self) -> Option<String> {
        let storage = self.storage.as_deref()?;
        Some(self.disk_size_gb.map_or_else(
            || storage.to_owned(),
            |size| format!("{storage}:{size}"),
        ))
    }
}

/// Builder for [`ContainerSpec`] that trims inputs and drops blank optionals.
#[derive(Clone, Debug, Default)]
pub struct ContainerSpecBuilder {
    spec: ContainerSpec,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|trimmed| !trimmed.is_empty())
}

impl ContainerSpecBuilder {
    /// Sets the hostname.
    #[must_use]
    pub fn hostname(mut self, value: impl Into<String>) -> Self {
        self.spec.hostname = value.into();
        self
    }

    /// Sets the OS template volume.
    #[must_use]
    pub fn os_template(mut self, value: impl Into<String>) -> Self {
        self.spec.os_template = value.into();
        self
    }

    /// Sets the core count.
    #[must_use]
    pub const fn cores(mut self, value: Option<u32>) -> Self {
        self.spec.cores = value;
        self
    }

    /// Sets the memory size.
    #[must_use]
    pub const fn memory_mb(mut self, value: Option<u32>) -> Self {
        self.spec.memory_mb = value;
        self
    }

    /// Sets the swap size.
    #[must_use]
    pub const fn swap_mb(mut self, value: Option<u32>) -> Self {
        self.spec.swap_mb = value;
        self
    }

    /// Sets the root filesystem storage and size.
    #[must_use]
    pub fn rootfs(mut self, storage: Option<String>, disk_size_gb: Option<u32>) -> Self {
        self.spec.storage = storage;
        self.spec.disk_size_gb = disk_size_gb;
        self
    }

    /// Sets the network interface definition.
    #[must_use]
    pub fn network(mut self, value: Option<String>) -> Self {
        self.spec.network = value;
        self
    }

    /// Sets the root password.
    #[must_use]
    pub fn password(mut self, value: Option<String>) -> Self {
        self.spec.password = value;
        self
    }

    /// Sets the authorised public keys.
    #[must_use]
    pub fn ssh_public_keys(mut self, value: Option<String>) -> Self {
        self.spec.ssh_public_keys = value;
        self
    }

    /// Sets whether the container is unprivileged.
    #[must_use]
    pub const fn unprivileged(mut self, value: bool) -> Self {
        self.spec.unprivileged = value;
        self
    }

    /// Sets whether the container starts on node boot.
    #[must_use]
    pub const fn onboot(mut self, value: bool) -> Self {
        self.spec.onboot = value;
        self
    }

    /// Sets whether the container starts after creation.
    #[must_use]
    pub const fn start(mut self, value: bool) -> Self {
        self.spec.start = value;
        self
    }

    /// Sets the resource pool.
    #[must_use]
    pub fn pool(mut self, value: Option<String>) -> Self {
        self.spec.pool = value;
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn tags(mut self, value: Vec<String>) -> Self {
        self.spec.tags = value;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, value: Option<String>) -> Self {
        self.spec.description = value;
        self
    }

    /// Sets the DNS server.
    #[must_use]
    pub fn nameserver(mut self, value: Option<String>) -> Self {
        self.spec.nameserver = value;
        self
    }

    /// Sets the DNS search domain.
    #[must_use]
    pub fn searchdomain(mut self, value: Option<String>) -> Self {
        self.spec.searchdomain = value;
        self
    }

    /// Builds and validates the [`ContainerSpec`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when validation fails.
    pub fn build(self) -> Result<ContainerSpec, BackendError> {
        let raw = self.spec;
        let spec = ContainerSpec {
            hostname: raw.hostname.trim().to_owned(),
            os_template: raw.os_template.trim().to_owned(),
            storage: non_blank(raw.storage),
            network: non_blank(raw.network),
            password: non_blank(raw.password),
            ssh_public_keys: non_blank(raw.ssh_public_keys),
            pool: non_blank(raw.pool),
            tags: raw
                .tags
                .into_iter()
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
            description: non_blank(raw.description),
            nameserver: non_blank(raw.nameserver),
            searchdomain: non_blank(raw.searchdomain),
            ..raw
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Completion record of an asynchronous hypervisor task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskStatus {
    /// Unique task identifier assigned by the hypervisor.
    pub upid: String,
    /// Exit status reported when the task stopped (`OK` on success).
    pub exit_status: String,
}

/// Errors raised while building backend requests.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when a field holds a value the hypervisor would reject.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Classification hooks that steps need from backend errors.
pub trait BackendErrorKind: std::error::Error + Send + Sync + 'static {
    /// Returns `true` when creation failed because another actor claimed the
    /// identifier between allocation and creation.
    fn is_duplicate_id(&self) -> bool;

    /// Returns `true` when the hypervisor accepted the request but its
    /// outcome was never observed, so the resource may exist.
    fn is_unconfirmed(&self) -> bool;
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Remote provisioning API consumed by the build steps.
///
/// Calls that start hypervisor tasks resolve once the task has stopped.
pub trait Backend: Send + Sync {
    /// Provider specific error type returned by the backend.
    type Error: BackendErrorKind;

    /// Returns the next free identifier, preferring `hint` when it is free.
    fn next_id(&self, hint: Option<VmId>) -> BackendFuture<'_, VmId, Self::Error>;

    /// Creates a container for `vm_ref` from `spec`.
    fn create_container<'a>(
        &'a self,
        vm_ref: &'a VmRef,
        spec: &'a ContainerSpec,
    ) -> BackendFuture<'a, TaskStatus, Self::Error>;

    /// Stops a container immediately.
    fn stop<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error>;

    /// Shuts a container down gracefully.
    fn shutdown<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error>;

    /// Converts a stopped container into a template.
    fn convert_to_template<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, (), Self::Error>;

    /// Deletes a container or template.
    fn delete<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error>;
}
