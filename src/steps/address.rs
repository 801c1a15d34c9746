//! Reads the container's address through the open session.

use std::sync::Arc;

use tracing::info;

use super::{CONTAINER_IP_KEY, halt_with};
use crate::runner::{Step, StepAction, StepFuture};
use crate::session::{DiscardOutput, Session};
use crate::state::{BuildState, StateKey, StepError};
use crate::ui::Ui;

/// Runs `lxc-info` for the container and records the reported address.
pub struct LookupContainerAddress {
    ui: Arc<dyn Ui>,
}

impl LookupContainerAddress {
    /// Creates the step.
    #[must_use]
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }
}

async fn lookup<S: Session>(state: &BuildState<S>) -> Result<String, StepError> {
    let vm_ref = state.require_vm_ref()?;
    let session = state.require_session()?;
    let command = format!("lxc-info -n {} -i -H", vm_ref.id);
    let output = session
        .run_command(&command, &DiscardOutput)
        .await
        .map_err(|err| StepError::Address {
            message: err.to_string(),
        })?;
    if !output.is_success() {
        let status = output
            .exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        return Err(StepError::Address {
            message: format!("`{command}` exited with status {status}: {}", output.stderr.trim()),
        });
    }
    let mut address = output.stdout;
    if address.ends_with('\n') {
        address.pop();
    }
    Ok(address)
}

impl<S: Session> Step<BuildState<S>> for LookupContainerAddress {
    fn name(&self) -> &'static str {
        "lookup-container-address"
    }

    fn requires(&self) -> &'static [StateKey] {
        &[StateKey::VmRef, StateKey::Session]
    }

    fn produces(&self) -> &'static [StateKey] {
        &[StateKey::ContainerIp]
    }

    fn run<'a>(&'a self, state: &'a mut BuildState<S>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            match lookup(state).await {
                Ok(address) => {
                    info!(address = %address, "container address");
                    self.ui.say(&format!("Container address: {address}"));
                    state.publish(CONTAINER_IP_KEY, address.clone());
                    state.put_container_ip(address);
                    StepAction::Continue
                }
                Err(err) => halt_with(state, self.ui.as_ref(), err),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backend::{VmId, VmRef};
    use crate::session::RemoteCommandOutput;
    use crate::test_support::{RecordingUi, SessionScript};

    fn connected_state(script: &SessionScript) -> BuildState<crate::test_support::ScriptedSession> {
        let mut state = BuildState::new(CancellationToken::new());
        state.put_vm_ref(VmRef::new(VmId::new(500), "pve1"));
        state.put_session(script.session());
        state
    }

    fn step() -> LookupContainerAddress {
        LookupContainerAddress::new(Arc::new(RecordingUi::default()))
    }

    #[rstest]
    #[case("10.0.0.5\n", "10.0.0.5")]
    #[case("10.0.0.5", "10.0.0.5")]
    #[case("\n", "")]
    #[tokio::test]
    async fn records_address_without_trailing_newline(#[case] stdout: &str, #[case] expected: &str) {
        let script = SessionScript::default();
        script.push(RemoteCommandOutput {
            exit_code: Some(0),
            stdout: stdout.to_owned(),
            stderr: String::new(),
        });
        let mut state = connected_state(&script);

        let action = step().run(&mut state).await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(state.container_ip(), Some(expected));
        assert_eq!(
            state.generated_data().get(CONTAINER_IP_KEY),
            Some(&serde_json::json!(expected))
        );
        assert_eq!(script.commands(), ["lxc-info -n 500 -i -H"]);
    }

    #[rstest]
    #[tokio::test]
    async fn failing_lookup_halts() {
        let script = SessionScript::default();
        script.push(RemoteCommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: String::from("lxc-info: no such container\n"),
        });
        let mut state = connected_state(&script);

        let action = step().run(&mut state).await;

        assert_eq!(action, StepAction::Halt);
        assert_eq!(state.container_ip(), None);
        assert!(
            matches!(state.error(), Some(StepError::Address { message }) if message.contains("no such container")),
            "unexpected error: {:?}",
            state.error()
        );
    }
}
