//! Shared fixtures for build BDD scenarios.

use std::sync::Arc;

use kiln::test_support::{RecordingUi, ScriptedBackend, ScriptedTransport};
use kiln::{BuildSettings, ContainerSpec, ProvisionAction, RetryPolicy, SessionTarget, VmId};
use rstest::fixture;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct BuildContext {
    pub backend: Arc<ScriptedBackend>,
    pub transport: Arc<ScriptedTransport>,
    pub ui: Arc<RecordingUi>,
    pub settings: BuildSettings,
    pub outcome: Option<BuildResult>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildFailureKind {
    Allocate,
    Create,
    Connect,
    Provision,
    Convert,
    Cancelled,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildResult {
    Success { template_id: String },
    Failure { kind: BuildFailureKind, message: String },
}

#[derive(Clone, Debug, Error)]
pub enum BuildTestError {
    #[error("invalid build fixture: {0}")]
    Fixture(String),
}

#[fixture]
pub fn build_context_result() -> Result<BuildContext, BuildTestError> {
    build_build_context()
}

#[fixture]
pub fn build_context(build_context_result: Result<BuildContext, BuildTestError>) -> BuildContext {
    build_context_result
        .unwrap_or_else(|err| panic!("build context fixture should initialise: {err}"))
}

fn build_build_context() -> Result<BuildContext, BuildTestError> {
    let spec = ContainerSpec::builder()
        .hostname("kiln-bdd")
        .os_template("local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst")
        .build()
        .map_err(|err| BuildTestError::Fixture(format!("container spec: {err}")))?;

    let transport = Arc::new(ScriptedTransport::new());

    Ok(BuildContext {
        backend: Arc::new(ScriptedBackend::new()),
        transport,
        ui: Arc::new(RecordingUi::default()),
        settings: BuildSettings {
            node: String::from("pve1"),
            vmid: VmId::new(0),
            pool: None,
            spec,
            target: SessionTarget {
                host: String::from("192.0.2.10"),
                port: 22,
                user: String::from("root"),
            },
            actions: vec![ProvisionAction::Shell(String::from("apt-get install -y nginx"))],
            retry: RetryPolicy::new(3),
        },
        outcome: None,
    })
}
