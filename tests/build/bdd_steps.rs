//! BDD step definitions for the `kiln build` workflow.

use std::sync::Arc;

use kiln::session::RemoteCommandOutput;
use kiln::test_support::{BackendCall, ScriptedBackend, ScriptedBackendError, ScriptedTransport};
use kiln::{Artifact, BuildError, Builder, StepError as BuildStepError, VmId};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{BuildContext, BuildFailureKind, BuildResult};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a ready build pipeline")]
fn ready_pipeline(build_context: BuildContext) -> BuildContext {
    build_context
}

#[given("the hypervisor allocates identifiers \"{ids}\"")]
fn allocates_identifiers(build_context: BuildContext, ids: String) -> Result<BuildContext, StepError> {
    let parsed = ids
        .split(',')
        .map(|id| {
            id.trim()
                .parse::<u32>()
                .map_err(|err| StepError::Assertion(format!("invalid identifier {id}: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    build_context.backend.push_next_ids(parsed);
    Ok(build_context)
}

#[given("the container identifier is fixed to \"{vmid}\"")]
fn fixed_identifier(mut build_context: BuildContext, vmid: u32) -> BuildContext {
    build_context.settings.vmid = VmId::new(vmid);
    build_context
}

#[given("the first create reports a duplicate identifier")]
fn first_create_duplicate(build_context: BuildContext) -> BuildContext {
    build_context
        .backend
        .push_create(Err(ScriptedBackendError::Duplicate(0)));
    build_context
}

#[given("the provisioning command exits with \"{code}\"")]
fn provisioning_exits(build_context: BuildContext, code: i32) -> BuildContext {
    let script = build_context.transport.session_script();
    script.push(RemoteCommandOutput {
        exit_code: Some(0),
        stdout: String::from("192.0.2.10\n"),
        stderr: String::new(),
    });
    script.push(RemoteCommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: String::from("E: Unable to locate package nginx"),
    });
    build_context
}

#[given("the container never accepts ssh")]
fn never_accepts_ssh(build_context: BuildContext) -> BuildContext {
    build_context.transport.hang_on_connect();
    build_context
}

fn builder(build_context: &BuildContext) -> Builder<ScriptedBackend, ScriptedTransport> {
    Builder::new(
        Arc::clone(&build_context.backend),
        Arc::clone(&build_context.transport),
        build_context.settings.clone(),
        build_context.ui.clone(),
    )
}

fn record(
    mut build_context: BuildContext,
    result: Result<Artifact<ScriptedBackend>, BuildError>,
) -> BuildContext {
    let outcome = match result {
        Ok(artifact) => BuildResult::Success {
            template_id: artifact.id(),
        },
        Err(err) => BuildResult::Failure {
            kind: map_failure_kind(&err),
            message: err.to_string(),
        },
    };
    build_context.outcome = Some(outcome);
    build_context
}

#[when("I run the build")]
fn run_build(build_context: BuildContext) -> Result<BuildContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let build = builder(&build_context);
    let result = runtime.block_on(build.run(CancellationToken::new()));
    Ok(record(build_context, result))
}

#[when("I run the build and cancel it")]
fn run_and_cancel(build_context: BuildContext) -> Result<BuildContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let build = builder(&build_context);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let (result, ()) = runtime.block_on(async {
        tokio::join!(build.run(cancel), async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        })
    });
    Ok(record(build_context, result))
}

#[then("the build produces template \"{id}\"")]
fn produces_template(build_context: &BuildContext, id: String) -> Result<(), StepError> {
    match &build_context.outcome {
        Some(BuildResult::Success { template_id }) if *template_id == id => Ok(()),
        Some(BuildResult::Success { template_id }) => Err(StepError::Assertion(format!(
            "expected template {id}, got {template_id}"
        ))),
        Some(BuildResult::Failure { message, .. }) => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the build error kind is \"{kind}\"")]
fn build_error_kind(build_context: &BuildContext, kind: String) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)?;
    let Some(BuildResult::Failure { kind: actual, message }) = &build_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if *actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {actual:?}: {message}"
        )))
    }
}

#[then("the backend calls are \"{calls}\"")]
fn backend_calls(build_context: &BuildContext, calls: String) -> Result<(), StepError> {
    let actual: Vec<_> = build_context
        .backend
        .calls()
        .iter()
        .map(BackendCall::kind)
        .collect();
    let expected: Vec<_> = calls.split(',').map(str::trim).collect();
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected calls {expected:?}, got {actual:?}"
        )))
    }
}

#[then("\"{count}\" creates were attempted")]
fn creates_attempted(build_context: &BuildContext, count: usize) -> Result<(), StepError> {
    let attempts = build_context.backend.creates().len();
    if attempts == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} creates, got {attempts}"
        )))
    }
}

#[then("no identifier was allocated")]
fn no_allocation(build_context: &BuildContext) -> Result<(), StepError> {
    if build_context.backend.allocations() == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "explicit identifiers should not be allocated",
        )))
    }
}

#[then("the container is deleted")]
fn container_deleted(build_context: &BuildContext) -> Result<(), StepError> {
    if build_context.backend.deletes().len() == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one delete, got calls {:?}",
            build_context.backend.calls()
        )))
    }
}

const fn map_failure_kind(err: &BuildError) -> BuildFailureKind {
    match err {
        BuildError::Cancelled => BuildFailureKind::Cancelled,
        BuildError::Step(step) => match step {
            BuildStepError::Allocate(_) => BuildFailureKind::Allocate,
            BuildStepError::Create { .. } | BuildStepError::RetriesExhausted { .. } => {
                BuildFailureKind::Create
            }
            BuildStepError::Connect(_) => BuildFailureKind::Connect,
            BuildStepError::Provision { .. } => BuildFailureKind::Provision,
            BuildStepError::Stop(_) | BuildStepError::Convert { .. } => BuildFailureKind::Convert,
            _ => BuildFailureKind::Other,
        },
        _ => BuildFailureKind::Other,
    }
}

fn parse_failure_kind(kind: &str) -> Result<BuildFailureKind, StepError> {
    match kind {
        "allocate" => Ok(BuildFailureKind::Allocate),
        "create" => Ok(BuildFailureKind::Create),
        "connect" => Ok(BuildFailureKind::Connect),
        "provision" => Ok(BuildFailureKind::Provision),
        "convert" => Ok(BuildFailureKind::Convert),
        "cancelled" => Ok(BuildFailureKind::Cancelled),
        "other" => Ok(BuildFailureKind::Other),
        _ => Err(StepError::Assertion(format!(
            "unknown failure kind: {kind}"
        ))),
    }
}
