//! Runs user-declared provisioning actions inside the container.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{halt_with, until_cancelled};
use crate::runner::{RunState, Step, StepAction, StepFuture};
use crate::session::{OutputSink, OutputStream, Session, expand_tilde};
use crate::state::{BuildState, StateKey, StepError};
use crate::ui::Ui;

/// One provisioning action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionAction {
    /// Shell command line run as is.
    Shell(String),
    /// Local script whose content is run through `sh -c`. A leading `~/`
    /// resolves against `HOME`.
    Script(Utf8PathBuf),
}

impl ProvisionAction {
    /// Renders the remote command line for this action.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Provision`] when a script cannot be read.
    pub fn command_line(&self) -> Result<String, StepError> {
        match self {
            Self::Shell(command) => Ok(command.clone()),
            Self::Script(path) => {
                let body = read_script(path).map_err(|message| StepError::Provision {
                    action: self.to_string(),
                    message: format!("failed to read script: {message}"),
                })?;
                Ok(format!("sh -c {}", escape(body.into())))
            }
        }
    }
}

fn read_script(path: &Utf8Path) -> Result<String, String> {
    let expanded = Utf8PathBuf::from(expand_tilde(path.as_str()));
    let file_name = expanded
        .file_name()
        .ok_or_else(|| format!("path has no file name: {expanded}"))?;
    let parent = expanded
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));

    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| format!("{parent}: {err}"))?;
    dir.read_to_string(file_name)
        .map_err(|err| format!("{expanded}: {err}"))
}

impl fmt::Display for ProvisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(command) => f.write_str(command),
            Self::Script(path) => write!(f, "script {path}"),
        }
    }
}

/// Relays command output to the reporter as it arrives.
struct UiOutput<'a> {
    ui: &'a dyn Ui,
}

impl OutputSink for UiOutput<'_> {
    fn line(&self, _stream: OutputStream, line: &str) {
        self.ui.message(line);
    }
}

enum Provisioned {
    Done,
    Cancelled,
}

/// Runs the configured actions in order; the first failure halts.
pub struct Provision {
    actions: Vec<ProvisionAction>,
    ui: Arc<dyn Ui>,
}

impl Provision {
    /// Creates the step.
    #[must_use]
    pub fn new(actions: Vec<ProvisionAction>, ui: Arc<dyn Ui>) -> Self {
        Self { actions, ui }
    }

    async fn run_actions<S: Session>(
        &self,
        session: &S,
        cancel: &CancellationToken,
    ) -> Result<Provisioned, StepError> {
        let sink = UiOutput {
            ui: self.ui.as_ref(),
        };
        for action in &self.actions {
            if cancel.is_cancelled() {
                return Ok(Provisioned::Cancelled);
            }
            self.ui.say(&format!("Provisioning with {action}"));
            let command = action.command_line()?;
            debug!(action = %action, "running provisioning action");

            let Some(result) = until_cancelled(cancel, session.run_command(&command, &sink)).await
            else {
                return Ok(Provisioned::Cancelled);
            };
            let output = result.map_err(|err| StepError::Provision {
                action: action.to_string(),
                message: err.to_string(),
            })?;

            if !output.is_success() {
                let status = output
                    .exit_code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string());
                return Err(StepError::Provision {
                    action: action.to_string(),
                    message: format!("exited with status {status}"),
                });
            }
        }
        Ok(Provisioned::Done)
    }
}

impl<S: Session> Step<BuildState<S>> for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn requires(&self) -> &'static [StateKey] {
        &[StateKey::Session]
    }

    fn run<'a>(&'a self, state: &'a mut BuildState<S>) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let cancel = state.cancellation().clone();
            let result = match state.require_session() {
                Ok(session) => self.run_actions(session, &cancel).await,
                Err(err) => Err(err.into()),
            };

            match result {
                Ok(Provisioned::Done) => {
                    info!(actions = self.actions.len(), "provisioning finished");
                    StepAction::Continue
                }
                Ok(Provisioned::Cancelled) => {
                    self.ui.say("Cancelled during provisioning");
                    StepAction::Halt
                }
                Err(err) => halt_with(state, self.ui.as_ref(), err),
            }
        })
    }
}
