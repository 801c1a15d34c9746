//! Waits until the container accepts a remote session.

use std::sync::Arc;

use tracing::info;

use super::{halt_with, until_cancelled};
use crate::runner::{RunState, Step, StepAction, StepFuture};
use crate::session::{SessionError, SessionTarget, Transport};
use crate::state::{BuildState, StateKey, StepError};
use crate::ui::Ui;

/// Opens a session to the build container and stores it in the state.
///
/// A timeout records an error. Cancellation halts without one so the
/// cancellation marker explains the halt.
pub struct WaitForSession<T> {
    transport: Arc<T>,
    target: SessionTarget,
    ui: Arc<dyn Ui>,
}

impl<T: Transport> WaitForSession<T> {
    /// Creates the step.
    #[must_use]
    pub fn new(transport: Arc<T>, target: SessionTarget, ui: Arc<dyn Ui>) -> Self {
        Self {
            transport,
            target,
            ui,
        }
    }
}

impl<T> Step<BuildState<T::Session>> for WaitForSession<T>
where
    T: Transport,
{
    fn name(&self) -> &'static str {
        "wait-for-session"
    }

    fn requires(&self) -> &'static [StateKey] {
        &[StateKey::VmRef]
    }

    fn produces(&self) -> &'static [StateKey] {
        &[StateKey::Session]
    }

    fn run<'a>(&'a self, state: &'a mut BuildState<T::Session>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let vm_ref = match state.require_vm_ref() {
                Ok(vm_ref) => vm_ref.clone(),
                Err(err) => return halt_with(state, self.ui.as_ref(), err.into()),
            };
            let cancel = state.cancellation().clone();
            self.ui.say(&format!(
                "Waiting for ssh on {}:{}...",
                self.target.host, self.target.port
            ));

            match until_cancelled(&cancel, self.transport.connect(&self.target, &cancel)).await {
                Some(Ok(session)) => {
                    info!(vmid = %vm_ref.id, host = %self.target.host, "session established");
                    self.ui.say("Connected to container");
                    state.put_session(session);
                    StepAction::Continue
                }
                None | Some(Err(SessionError::Cancelled { .. })) => {
                    self.ui.say("Cancelled while waiting for ssh");
                    StepAction::Halt
                }
                Some(Err(err)) => halt_with(state, self.ui.as_ref(), StepError::Connect(err)),
            }
        })
    }
}
