//! Assembles the build pipeline and turns a finished run into an
//! [`Artifact`].

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::backend::{Backend, ContainerSpec, VmId, VmRef};
use crate::config::{ConfigError, ContainerConfig, ProxmoxConfig};
use crate::runner::{PipelineError, Step, StepRunner};
use crate::session::{SessionError, SessionTarget, SshConfig, Transport};
use crate::state::{BuildState, StateError, StepError};
use crate::steps::{
    ConvertToTemplate, CreateContainer, LookupContainerAddress, Provision, ProvisionAction,
    RetryPolicy, WaitForSession,
};
use crate::ui::Ui;

/// Everything a build needs besides its collaborators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSettings {
    /// Node hosting the build container.
    pub node: String,
    /// Explicit identifier, or unset to let the hypervisor allocate one.
    pub vmid: VmId,
    /// Resource pool for the container.
    pub pool: Option<String>,
    /// Container parameters.
    pub spec: ContainerSpec,
    /// Where the session is opened.
    pub target: SessionTarget,
    /// Provisioning actions in execution order.
    pub actions: Vec<ProvisionAction>,
    /// Create retry budget.
    pub retry: RetryPolicy,
}

impl BuildSettings {
    /// Derives settings from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] when the container section is invalid
    /// and [`BuildError::Session`] when no session host is configured.
    pub fn from_config(
        proxmox: &ProxmoxConfig,
        container: &ContainerConfig,
        ssh: &SshConfig,
        actions: Vec<ProvisionAction>,
    ) -> Result<Self, BuildError> {
        let spec = container.as_spec()?;
        let target = ssh.target()?;
        Ok(Self {
            node: proxmox.node.trim().to_owned(),
            vmid: container.vm_id(),
            pool: container.pool.clone(),
            spec,
            target,
            actions,
            retry: RetryPolicy::new(container.create_attempts),
        })
    }
}

/// Builds one container template per [`Builder::run`].
pub struct Builder<B, T> {
    backend: Arc<B>,
    transport: Arc<T>,
    settings: BuildSettings,
    ui: Arc<dyn Ui>,
}

impl<B, T> Builder<B, T>
where
    B: Backend + 'static,
    T: Transport + 'static,
{
    /// Creates a builder.
    #[must_use]
    pub fn new(backend: Arc<B>, transport: Arc<T>, settings: BuildSettings, ui: Arc<dyn Ui>) -> Self {
        Self {
            backend,
            transport,
            settings,
            ui,
        }
    }

    fn steps(&self) -> Vec<Box<dyn Step<BuildState<T::Session>>>> {
        let settings = &self.settings;
        vec![
            Box::new(
                CreateContainer::new(
                    Arc::clone(&self.backend),
                    settings.spec.clone(),
                    settings.vmid,
                    settings.node.as_str(),
                    Arc::clone(&self.ui),
                )
                .with_pool(settings.pool.clone())
                .with_retry(settings.retry),
            ),
            Box::new(WaitForSession::new(
                Arc::clone(&self.transport),
                settings.target.clone(),
                Arc::clone(&self.ui),
            )),
            Box::new(LookupContainerAddress::new(Arc::clone(&self.ui))),
            Box::new(Provision::new(settings.actions.clone(), Arc::clone(&self.ui))),
            Box::new(ConvertToTemplate::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.ui),
            )),
        ]
    }

    /// Runs the pipeline once.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Step`] with the error that halted the run,
    /// [`BuildError::Cancelled`] when `cancel` fired first, and
    /// [`BuildError::Pipeline`] when the step sequence is inconsistent.
    pub async fn run(&self, cancel: CancellationToken) -> Result<Artifact<B>, BuildError> {
        let runner = StepRunner::new(self.steps(), &[])?;
        debug!(steps = ?runner.step_names(), "starting build");

        let mut state = BuildState::new(cancel);
        let outcome = runner.run(&mut state).await;
        debug!(?outcome, "build finished");

        if let Some(err) = state.take_error() {
            return Err(BuildError::Step(err));
        }
        if state.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let id = state.require_template_id()?;
        let node = state.require_vm_ref()?.node.clone();
        info!(vmid = %id, node = %node, "template ready");
        Ok(Artifact::new(
            VmRef::new(id, node),
            Arc::clone(&self.backend),
            state.take_generated_data(),
        ))
    }
}

/// Errors returned by [`Builder`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// A step halted the run.
    #[error(transparent)]
    Step(StepError),
    /// The run was cancelled before it finished.
    #[error("build was cancelled")]
    Cancelled,
    /// The step sequence is inconsistent.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// The run ended without its deliverable.
    #[error(transparent)]
    State(#[from] StateError),
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Session settings are invalid.
    #[error(transparent)]
    Session(#[from] SessionError),
}
