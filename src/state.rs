//! Typed shared context for one build run.
//!
//! Each field corresponds to one entry of the step vocabulary. A field that
//! was never written is `None`, which is distinct from a written but empty
//! value (an empty address string is still present).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{VmId, VmRef};
use crate::runner::RunState;
use crate::session::SessionError;

/// Data published during a run for later pipeline stages.
pub type GeneratedData = BTreeMap<String, serde_json::Value>;

/// Boxed error carried inside [`StepError`] variants for backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Context entries that steps declare as preconditions and postconditions.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StateKey {
    /// Reference to the container created for the build.
    VmRef,
    /// Open remote session.
    Session,
    /// Address reported by the container.
    ContainerIp,
    /// Identifier of the finished template.
    TemplateId,
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VmRef => "vm_ref",
            Self::Session => "session",
            Self::ContainerIp => "container_ip",
            Self::TemplateId => "template_id",
        };
        f.write_str(name)
    }
}

/// Raised when a step reads an entry no earlier step wrote.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum StateError {
    /// The entry is absent.
    #[error("build state has no {0}")]
    Missing(StateKey),
}

/// Error a step records before halting the run.
#[derive(Debug, Error)]
pub enum StepError {
    /// Allocating a container identifier failed.
    #[error("error allocating container identifier: {0}")]
    Allocate(#[source] BoxError),
    /// Creating the container failed.
    #[error("error creating container {vm_ref}: {source}")]
    Create {
        /// Reference the create was attempted for.
        vm_ref: VmRef,
        /// Backend failure.
        #[source]
        source: BoxError,
    },
    /// Every allocated identifier was taken before creation.
    #[error("unable to create container after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of create attempts made.
        attempts: u32,
        /// Failure of the last attempt.
        #[source]
        source: BoxError,
    },
    /// The container never accepted a session.
    #[error("error waiting for ssh: {0}")]
    Connect(#[source] SessionError),
    /// Looking up the container's address failed.
    #[error("error looking up container address: {message}")]
    Address {
        /// Failure description.
        message: String,
    },
    /// A provisioning action failed or exited non-zero.
    #[error("provisioning action `{action}` failed: {message}")]
    Provision {
        /// Action that failed.
        action: String,
        /// Failure description.
        message: String,
    },
    /// Stopping the container before conversion failed.
    #[error("error converting VM to template, could not stop: {0}")]
    Stop(#[source] BoxError),
    /// Converting the stopped container failed.
    #[error("error converting {vm_ref} to template: {source}")]
    Convert {
        /// Reference being converted.
        vm_ref: VmRef,
        /// Backend failure.
        #[source]
        source: BoxError,
    },
    /// A precondition was missing at run time.
    #[error(transparent)]
    State(#[from] StateError),
    /// A step panicked while running.
    #[error("step {step} panicked")]
    Panicked {
        /// Name of the step.
        step: String,
    },
}

/// Shared context for a single run.
///
/// `S` is the session type produced by the transport.
#[derive(Debug)]
pub struct BuildState<S> {
    vm_ref: Option<VmRef>,
    session: Option<S>,
    container_ip: Option<String>,
    template_id: Option<VmId>,
    generated_data: GeneratedData,
    error: Option<StepError>,
    cancelled: bool,
    cancel: CancellationToken,
}

impl<S> BuildState<S> {
    /// Creates an empty state observing `cancel`.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            vm_ref: None,
            session: None,
            container_ip: None,
            template_id: None,
            generated_data: GeneratedData::new(),
            error: None,
            cancelled: false,
            cancel,
        }
    }

    /// Records the container reference.
    pub fn put_vm_ref(&mut self, vm_ref: VmRef) {
        self.vm_ref = Some(vm_ref);
    }

    /// Returns the container reference if one was recorded.
    #[must_use]
    pub const fn vm_ref(&self) -> Option<&VmRef> {
        self.vm_ref.as_ref()
    }

    /// Returns the container reference.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Missing`] when no reference was recorded.
    pub fn require_vm_ref(&self) -> Result<&VmRef, StateError> {
        self.vm_ref
            .as_ref()
            .ok_or(StateError::Missing(StateKey::VmRef))
    }

    /// Stores the open session.
    pub fn put_session(&mut self, session: S) {
        self.session = Some(session);
    }

    /// Returns the session if one was opened.
    #[must_use]
    pub const fn session(&self) -> Option<&S> {
        self.session.as_ref()
    }

    /// Returns the open session.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Missing`] when no session was stored.
    pub fn require_session(&self) -> Result<&S, StateError> {
        self.session
            .as_ref()
            .ok_or(StateError::Missing(StateKey::Session))
    }

    /// Records the container address.
    pub fn put_container_ip(&mut self, address: impl Into<String>) {
        self.container_ip = Some(address.into());
    }

    /// Returns the container address if it was looked up.
    #[must_use]
    pub fn container_ip(&self) -> Option<&str> {
        self.container_ip.as_deref()
    }

    /// Records the template identifier.
    pub fn put_template_id(&mut self, id: VmId) {
        self.template_id = Some(id);
    }

    /// Returns the template identifier if conversion finished.
    #[must_use]
    pub const fn template_id(&self) -> Option<VmId> {
        self.template_id
    }

    /// Returns the template identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Missing`] when conversion never finished.
    pub fn require_template_id(&self) -> Result<VmId, StateError> {
        self.template_id
            .ok_or(StateError::Missing(StateKey::TemplateId))
    }

    /// Publishes a generated-data entry.
    pub fn publish(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.generated_data.insert(key.into(), value.into());
    }

    /// Returns the generated data published so far.
    #[must_use]
    pub const fn generated_data(&self) -> &GeneratedData {
        &self.generated_data
    }

    /// Moves the generated data out of the state.
    pub fn take_generated_data(&mut self) -> GeneratedData {
        std::mem::take(&mut self.generated_data)
    }

    /// Records the error that halted the run. The first error wins.
    pub fn record_error(&mut self, error: StepError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Returns the recorded error, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    /// Moves the recorded error out of the state.
    pub fn take_error(&mut self) -> Option<StepError> {
        self.error.take()
    }

    /// Returns `true` once the runner observed cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl<S: Send> RunState for BuildState<S> {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    fn record_panic(&mut self, step: &str) {
        self.record_error(StepError::Panicked {
            step: step.to_owned(),
        });
    }
}
