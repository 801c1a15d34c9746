//! Polling of hypervisor tasks until they stop.

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::types::{TaskState, TaskStatusBody, Upid};
use super::{ProxmoxClient, ProxmoxError};
use crate::backend::TaskStatus;

const STOPPED: &str = "stopped";
const EXIT_OK: &str = "OK";
const EXIT_WARNINGS: &str = "WARNINGS";

/// Returns `true` for exit statuses Proxmox treats as success.
fn exit_succeeded(exit_status: &str) -> bool {
    exit_status == EXIT_OK || exit_status.starts_with(EXIT_WARNINGS)
}

impl ProxmoxClient {
    /// Waits until `upid` stops, failing on a non-OK exit status or once the
    /// task timeout elapses.
    pub(super) async fn wait_for_task(
        &self,
        node: &str,
        upid: &Upid,
    ) -> Result<TaskStatus, ProxmoxError> {
        let deadline = Instant::now() + self.task_timeout;
        loop {
            let body: TaskStatusBody = self
                .call(
                    reqwest::Method::GET,
                    &["nodes", node, "tasks", upid.as_str(), "status"],
                )
                .await
                .map_err(|err| ProxmoxError::TaskUnobserved {
                    upid: upid.as_str().to_owned(),
                    message: err.to_string(),
                })?;
            let state = TaskState::from(body.status);
            if state.as_str() == STOPPED {
                let exit_status = body.exitstatus.unwrap_or_default();
                if !exit_succeeded(&exit_status) {
                    return Err(ProxmoxError::TaskFailed {
                        upid: upid.as_str().to_owned(),
                        exit_status,
                    });
                }
                info!(upid = %upid.as_str(), %exit_status, "task finished");
                return Ok(TaskStatus {
                    upid: upid.as_str().to_owned(),
                    exit_status,
                });
            }

            debug!(upid = %upid.as_str(), state = %state.as_str(), "task still running");
            if Instant::now() + self.poll_interval > deadline {
                return Err(ProxmoxError::TaskTimeout {
                    upid: upid.as_str().to_owned(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}
