//! Container creation with bounded retries on identifier races.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{NODE_KEY, VM_ID_KEY, halt_with, until_cancelled};
use crate::backend::{Backend, BackendErrorKind, ContainerSpec, VmId, VmRef};
use crate::runner::{RunOutcome, RunState, Step, StepAction, StepFuture};
use crate::state::{BuildState, StateKey, StepError};
use crate::ui::Ui;

/// Bound on create attempts when the hypervisor allocates identifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Allows up to `max_attempts` creates; zero is treated as one.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    /// Returns the attempt bound.
    #[must_use]
    pub const fn max_attempts(self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CREATE_ATTEMPTS)
    }
}

/// Creates the build container and records its reference.
///
/// An explicitly configured identifier is used as is and never retried. An
/// allocated identifier that another actor claims before creation is
/// replaced by a fresh allocation until the [`RetryPolicy`] is spent.
pub struct CreateContainer<B> {
    backend: Arc<B>,
    spec: ContainerSpec,
    vmid: VmId,
    node: String,
    pool: Option<String>,
    retry: RetryPolicy,
    ui: Arc<dyn Ui>,
}

enum Created {
    Ready(VmRef),
    /// Accepted by the hypervisor but not confirmed; the container may exist.
    Unconfirmed(VmRef, StepError),
    Cancelled,
}

impl<B: Backend> CreateContainer<B> {
    /// Creates the step. A `vmid` of zero asks the hypervisor for one.
    #[must_use]
    pub fn new(
        backend: Arc<B>,
        spec: ContainerSpec,
        vmid: VmId,
        node: impl Into<String>,
        ui: Arc<dyn Ui>,
    ) -> Self {
        Self {
            backend,
            spec,
            vmid,
            node: node.into(),
            pool: None,
            retry: RetryPolicy::default(),
            ui,
        }
    }

    /// Assigns created containers to a resource pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Option<String>) -> Self {
        self.pool = pool;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn create(&self, cancel: &CancellationToken) -> Result<Created, StepError> {
        let explicit = !self.vmid.is_unset();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = if explicit {
                self.vmid
            } else {
                let Some(next) = until_cancelled(cancel, self.backend.next_id(None)).await else {
                    return Ok(Created::Cancelled);
                };
                next.map_err(|err| StepError::Allocate(Box::new(err)))?
            };

            let vm_ref = VmRef::new(id, self.node.as_str()).with_pool(self.pool.clone());
            info!(vmid = %id, node = %self.node, attempt, "creating container");
            // Not raced against cancellation: a finished create must be
            // recorded so cleanup can remove it.
            match self.backend.create_container(&vm_ref, &self.spec).await {
                Ok(status) => {
                    debug!(upid = %status.upid, "create task finished");
                    return Ok(Created::Ready(vm_ref));
                }
                Err(err) if err.is_unconfirmed() => {
                    warn!(vmid = %id, error = %err, "create accepted but not confirmed");
                    let error = StepError::Create {
                        vm_ref: vm_ref.clone(),
                        source: Box::new(err),
                    };
                    return Ok(Created::Unconfirmed(vm_ref, error));
                }
                Err(err) if !explicit && err.is_duplicate_id() => {
                    if attempt >= self.retry.max_attempts() {
                        return Err(StepError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    warn!(vmid = %id, attempt, "identifier already taken, allocating another");
                    if cancel.is_cancelled() {
                        return Ok(Created::Cancelled);
                    }
                }
                Err(err) => {
                    return Err(StepError::Create {
                        vm_ref,
                        source: Box::new(err),
                    });
                }
            }
        }
    }
}

impl<B, S> Step<BuildState<S>> for CreateContainer<B>
where
    B: Backend,
    S: Send + Sync,
{
    fn name(&self) -> &'static str {
        "create-container"
    }

    fn produces(&self) -> &'static [StateKey] {
        &[StateKey::VmRef]
    }

    fn run<'a>(&'a self, state: &'a mut BuildState<S>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            self.ui.say("Creating container...");
            let cancel = state.cancellation().clone();
            match self.create(&cancel).await {
                Ok(Created::Ready(vm_ref)) => {
                    self.ui.say(&format!("Created container {vm_ref}"));
                    state.publish(VM_ID_KEY, vm_ref.id.get());
                    state.publish(NODE_KEY, vm_ref.node.clone());
                    state.put_vm_ref(vm_ref);
                    StepAction::Continue
                }
                Ok(Created::Unconfirmed(vm_ref, err)) => {
                    state.put_vm_ref(vm_ref);
                    halt_with(state, self.ui.as_ref(), err)
                }
                Ok(Created::Cancelled) => StepAction::Halt,
                Err(err) => halt_with(state, self.ui.as_ref(), err),
            }
        })
    }

    fn cleanup<'a>(&'a self, state: &'a mut BuildState<S>, outcome: RunOutcome) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let Some(vm_ref) = state.vm_ref().cloned() else {
                return;
            };
            if outcome.is_completed() {
                debug!(vmid = %vm_ref.id, "run completed, keeping container");
                return;
            }

            self.ui.say(&format!("Stopping container {vm_ref}"));
            if let Err(err) = self.backend.stop(&vm_ref).await {
                warn!(vmid = %vm_ref.id, error = %err, "failed to stop container");
                self.ui
                    .error(&format!("Error stopping container {vm_ref}: {err}"));
            }

            self.ui.say(&format!("Deleting container {vm_ref}"));
            if let Err(err) = self.backend.delete(&vm_ref).await {
                warn!(vmid = %vm_ref.id, error = %err, "failed to delete container");
                self.ui.error(&format!(
                    "Error deleting container {vm_ref}. Please stop and delete it manually: {err}"
                ));
            }
        })
    }
}
