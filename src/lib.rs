//! Core library for kiln, a Proxmox LXC template builder.
//!
//! A build runs an ordered sequence of steps against a shared state:
//! create a container, wait for a session, look up its address, provision
//! it, and convert it into a template. Whatever a halted or cancelled run
//! leaves behind is torn down in reverse order.

pub mod artifact;
pub mod backend;
pub mod builder;
pub mod config;
pub mod proxmox;
pub mod runner;
pub mod session;
pub mod state;
pub mod steps;
pub mod test_support;
pub mod ui;

pub use artifact::{Artifact, BUILDER_ID};
pub use backend::{Backend, BackendError, ContainerSpec, ContainerSpecBuilder, VmId, VmRef};
pub use builder::{BuildError, BuildSettings, Builder};
pub use config::{ConfigError, ContainerConfig, ProxmoxConfig};
pub use proxmox::{ProxmoxClient, ProxmoxError};
pub use runner::{RunOutcome, Step, StepAction, StepRunner};
pub use session::{SessionError, SessionTarget, SshConfig, SshTransport};
pub use state::{BuildState, GeneratedData, StateKey, StepError};
pub use steps::{ProvisionAction, RetryPolicy};
pub use ui::{TerminalUi, Ui};
