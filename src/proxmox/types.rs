//! Newtypes and wire payloads for the Proxmox API.

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::backend::{ContainerSpec, VmRef};

macro_rules! newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }
    };
}

newtype!(Upid);
newtype!(TaskState);

/// Every Proxmox response wraps its payload in `data`.
#[derive(Debug, Deserialize)]
pub(super) struct Envelope<T> {
    pub(super) data: T,
}

/// Error body returned alongside non-success statuses.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub(super) message: Option<String>,
    #[serde(default)]
    pub(super) errors: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ErrorBody {
    pub(super) fn render(self, fallback: String) -> String {
        let mut parts = Vec::new();
        if let Some(message) = self.message {
            parts.push(message.trim().to_owned());
        }
        if let Some(errors) = self.errors {
            for (field, value) in errors {
                let detail = value
                    .as_str()
                    .map_or_else(|| value.to_string(), str::to_owned);
                parts.push(format!("{field}: {}", detail.trim()));
            }
        }
        if parts.is_empty() {
            fallback
        } else {
            parts.join("; ")
        }
    }
}

/// Payload of `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Deserialize)]
pub(super) struct TaskStatusBody {
    pub(super) status: String,
    #[serde(default)]
    pub(super) exitstatus: Option<String>,
}

/// Payload of `POST /access/ticket`.
#[derive(Debug, Deserialize)]
pub(super) struct TicketBody {
    pub(super) ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub(super) csrf_prevention_token: String,
}

/// Form body of `POST /nodes/{node}/lxc`.
#[derive(Debug, Serialize)]
pub(super) struct CreateContainerForm<'a> {
    vmid: u32,
    hostname: &'a str,
    ostemplate: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    swap: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rootfs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    net0: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(rename = "ssh-public-keys", skip_serializing_if = "Option::is_none")]
    ssh_public_keys: Option<&'a str>,
    unprivileged: u8,
    onboot: u8,
    start: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameserver: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    searchdomain: Option<&'a str>,
}

impl<'a> CreateContainerForm<'a> {
    /// Builds the form, letting the reference's pool override the spec's.
    pub(super) fn new(vm_ref: &'a VmRef, spec: &'a ContainerSpec) -> Self {
        Self {
            vmid: vm_ref.id.get(),
            hostname: &spec.hostname,
            ostemplate: &spec.os_template,
            cores: spec.cores,
            memory: spec.memory_mb,
            swap: spec.swap_mb,
            rootfs: spec.rootfs(),
            net0: spec.network.as_deref(),
            password: spec.password.as_deref(),
            ssh_public_keys: spec.ssh_public_keys.as_deref(),
            unprivileged: u8::from(spec.unprivileged),
            onboot: u8::from(spec.onboot),
            start: u8::from(spec.start),
            pool: vm_ref.pool.as_deref().or(spec.pool.as_deref()),
            tags: (!spec.tags.is_empty()).then(|| spec.tags.join(";")),
            description: spec.description.as_deref(),
            nameserver: spec.nameserver.as_deref(),
            searchdomain: spec.searchdomain.as_deref(),
        }
    }
}
