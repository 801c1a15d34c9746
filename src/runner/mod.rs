//! Ordered step execution with halt propagation and reverse-order cleanup.
//!
//! A [`StepRunner`] drives a fixed sequence of [`Step`]s against one
//! context. Forward progress stops when a step halts or the context's
//! cancellation token fires; every step that was started then gets its
//! cleanup, most recently started first. The runner never looks at why a
//! run stopped; steps report failures through the context.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::StateKey;

/// Future returned by step operations.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a step's `run`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop forward progress and tear down.
    Halt,
}

/// How a run ended, passed to every cleanup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Every step continued and no cancellation was observed.
    Completed,
    /// A step halted.
    Halted,
    /// The cancellation token fired.
    Cancelled,
}

impl RunOutcome {
    /// Returns `true` when the run produced its deliverable.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Run-level hooks the runner needs from a context.
pub trait RunState: Send {
    /// Token observed between steps.
    fn cancellation(&self) -> &CancellationToken;

    /// Marks the context as cancelled.
    fn mark_cancelled(&mut self);

    /// Records that `step` panicked while running.
    fn record_panic(&mut self, step: &str);
}

/// A unit of work with a best-effort undo.
///
/// `cleanup` runs for every started step, including one whose `run` halted
/// or panicked, so it must tolerate partially written context.
pub trait Step<C>: Send + Sync {
    /// Name used in logs and pipeline errors.
    fn name(&self) -> &'static str;

    /// Context entries that must be written before this step runs.
    fn requires(&self) -> &'static [StateKey] {
        &[]
    }

    /// Context entries this step writes when it continues.
    fn produces(&self) -> &'static [StateKey] {
        &[]
    }

    /// Executes the step.
    fn run<'a>(&'a self, state: &'a mut C) -> StepFuture<'a, StepAction>;

    /// Undoes the step's side effects according to `outcome`.
    fn cleanup<'a>(&'a self, state: &'a mut C, outcome: RunOutcome) -> StepFuture<'a, ()> {
        let _ = (state, outcome);
        Box::pin(async {})
    }
}

/// Raised when a step sequence cannot be satisfied.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// A step requires an entry that is neither seeded nor produced by an
    /// earlier step.
    #[error("step {step} requires {key}, which no earlier step produces")]
    UnsatisfiedRequirement {
        /// Step with the unmet requirement.
        step: &'static str,
        /// Entry that is unavailable.
        key: StateKey,
    },
}

/// Executes a validated step sequence.
pub struct StepRunner<C> {
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C: RunState> std::fmt::Debug for StepRunner<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl<C: RunState> StepRunner<C> {
    /// Validates `steps` against the entries available at the start of the
    /// run.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnsatisfiedRequirement`] for the first step
    /// whose requirements are not met.
    pub fn new(steps: Vec<Box<dyn Step<C>>>, seeded: &[StateKey]) -> Result<Self, PipelineError> {
        let mut available: BTreeSet<StateKey> = seeded.iter().copied().collect();
        for step in &steps {
            if let Some(key) = step
                .requires()
                .iter()
                .find(|key| !available.contains(*key))
            {
                return Err(PipelineError::UnsatisfiedRequirement {
                    step: step.name(),
                    key: *key,
                });
            }
            available.extend(step.produces().iter().copied());
        }
        Ok(Self { steps })
    }

    /// Returns the step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs the steps against `state` and tears down.
    pub async fn run(&self, state: &mut C) -> RunOutcome {
        let mut started = 0;
        let mut outcome = RunOutcome::Completed;

        for step in &self.steps {
            if state.cancellation().is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }

            started += 1;
            let name = step.name();
            debug!(step = name, "running step");
            let action = match AssertUnwindSafe(step.run(state)).catch_unwind().await {
                Ok(action) => action,
                Err(_) => {
                    error!(step = name, "step panicked");
                    state.record_panic(name);
                    StepAction::Halt
                }
            };

            if state.cancellation().is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }
            if action == StepAction::Halt {
                info!(step = name, "step halted the run");
                outcome = RunOutcome::Halted;
                break;
            }
        }

        if outcome == RunOutcome::Cancelled {
            info!("run cancelled");
            state.mark_cancelled();
        }

        for step in self.steps.iter().take(started).rev() {
            debug!(step = step.name(), ?outcome, "cleaning up step");
            if AssertUnwindSafe(step.cleanup(state, outcome))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(step = step.name(), "cleanup panicked");
            }
        }

        outcome
    }
}
