//! The build pipeline: create, connect, inspect, provision, convert.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::runner::StepAction;
use crate::state::{BuildState, StepError};
use crate::ui::Ui;

mod address;
mod connect;
mod convert;
mod create;
mod provision;

pub use address::LookupContainerAddress;
pub use connect::WaitForSession;
pub use convert::ConvertToTemplate;
pub use create::{CreateContainer, RetryPolicy};
pub use provision::{Provision, ProvisionAction};

/// Generated-data key holding the container identifier.
pub const VM_ID_KEY: &str = "VmId";
/// Generated-data key holding the node name.
pub const NODE_KEY: &str = "Node";
/// Generated-data key holding the container address.
pub const CONTAINER_IP_KEY: &str = "ContainerIp";

/// Awaits `future` unless `cancel` fires first, returning `None` on
/// cancellation. The abandoned future is dropped.
pub async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

fn halt_with<S>(state: &mut BuildState<S>, ui: &dyn Ui, error: StepError) -> StepAction {
    ui.error(&error.to_string());
    state.record_error(error);
    StepAction::Halt
}
