//! Shuts the container down and turns it into a template.

use std::sync::Arc;

use tracing::info;

use super::{halt_with, until_cancelled};
use crate::backend::Backend;
use crate::runner::{RunState, Step, StepAction, StepFuture};
use crate::state::{BuildState, StateKey, StepError};
use crate::ui::Ui;

/// Converts the provisioned container into a template.
///
/// Nothing is undone on teardown; once conversion succeeds the identifier
/// names the deliverable.
pub struct ConvertToTemplate<B> {
    backend: Arc<B>,
    ui: Arc<dyn Ui>,
}

impl<B: Backend> ConvertToTemplate<B> {
    /// Creates the step.
    #[must_use]
    pub fn new(backend: Arc<B>, ui: Arc<dyn Ui>) -> Self {
        Self { backend, ui }
    }
}

impl<B, S> Step<BuildState<S>> for ConvertToTemplate<B>
where
    B: Backend,
    S: Send + Sync,
{
    fn name(&self) -> &'static str {
        "convert-to-template"
    }

    fn requires(&self) -> &'static [StateKey] {
        &[StateKey::VmRef]
    }

    fn produces(&self) -> &'static [StateKey] {
        &[StateKey::TemplateId]
    }

    fn run<'a>(&'a self, state: &'a mut BuildState<S>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let vm_ref = match state.require_vm_ref() {
                Ok(vm_ref) => vm_ref.clone(),
                Err(err) => return halt_with(state, self.ui.as_ref(), err.into()),
            };
            let cancel = state.cancellation().clone();

            self.ui.say("Stopping container");
            match until_cancelled(&cancel, self.backend.shutdown(&vm_ref)).await {
                None => return StepAction::Halt,
                Some(Err(err)) => {
                    return halt_with(state, self.ui.as_ref(), StepError::Stop(Box::new(err)));
                }
                Some(Ok(_)) => {}
            }

            self.ui.say("Converting container to a template");
            match until_cancelled(&cancel, self.backend.convert_to_template(&vm_ref)).await {
                None => StepAction::Halt,
                Some(Err(err)) => halt_with(
                    state,
                    self.ui.as_ref(),
                    StepError::Convert {
                        vm_ref,
                        source: Box::new(err),
                    },
                ),
                Some(Ok(())) => {
                    info!(vmid = %vm_ref.id, node = %vm_ref.node, "template created");
                    state.put_template_id(vm_ref.id);
                    StepAction::Continue
                }
            }
        })
    }
}
