//! Error types for the Proxmox backend.

use thiserror::Error;

use crate::backend::{BackendError, BackendErrorKind};
use crate::config::ConfigError;

/// Message fragment Proxmox uses when a create races on an identifier.
pub(super) const DUPLICATE_ID_FRAGMENT: &str = "already exists on node";

/// Errors raised by the Proxmox backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProxmoxError {
    /// Raised when the connection configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid container request: {0}")]
    Validation(String),
    /// Raised when ticket login or token authentication is rejected.
    #[error("authentication failed for {username}: {message}")]
    Auth {
        /// User that attempted to authenticate.
        username: String,
        /// Message returned by the API.
        message: String,
    },
    /// Raised when the identifier was claimed by someone else between
    /// allocation and creation.
    #[error("container {vmid} already exists on node {node}")]
    DuplicateId {
        /// Identifier that was already taken.
        vmid: u32,
        /// Node the create was sent to.
        node: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("{method} {path} failed with status {status}: {message}")]
    Api {
        /// HTTP method of the failing call.
        method: String,
        /// API path of the failing call.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response.
        message: String,
    },
    /// Raised when a hypervisor task stops with a non-OK exit status.
    #[error("task {upid} failed: {exit_status}")]
    TaskFailed {
        /// Task identifier.
        upid: String,
        /// Exit status reported by the task.
        exit_status: String,
    },
    /// Raised when a task does not stop before the task timeout.
    #[error("timeout waiting for task {upid}")]
    TaskTimeout {
        /// Task identifier.
        upid: String,
    },
    /// Raised when polling an accepted task fails before it stops.
    #[error("lost track of task {upid}: {message}")]
    TaskUnobserved {
        /// Task identifier.
        upid: String,
        /// Error raised by the status poll.
        message: String,
    },
    /// Raised when the HTTP transport fails.
    #[error("transport error: {message}")]
    Transport {
        /// Message returned by the HTTP client.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("failed to decode response from {path}: {message}")]
    Decode {
        /// API path whose response was malformed.
        path: String,
        /// Decoder message.
        message: String,
    },
}

impl ProxmoxError {
    pub(super) fn transport(err: &reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    /// Rewrites a failed create into [`ProxmoxError::DuplicateId`] when the
    /// hypervisor reports the identifier as taken.
    pub(super) fn classify_create(self, vmid: u32, node: &str) -> Self {
        let duplicate = match &self {
            Self::Api { message, .. } => message.contains(DUPLICATE_ID_FRAGMENT),
            Self::TaskFailed { exit_status, .. } => exit_status.contains(DUPLICATE_ID_FRAGMENT),
            _ => false,
        };
        if duplicate {
            Self::DuplicateId {
                vmid,
                node: node.to_owned(),
            }
        } else {
            self
        }
    }
}

impl BackendErrorKind for ProxmoxError {
    fn is_duplicate_id(&self) -> bool {
        matches!(self, Self::DuplicateId { .. })
    }

    fn is_unconfirmed(&self) -> bool {
        matches!(self, Self::TaskTimeout { .. } | Self::TaskUnobserved { .. })
    }
}

impl From<BackendError> for ProxmoxError {
    fn from(value: BackendError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<ConfigError> for ProxmoxError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
