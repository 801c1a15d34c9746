//! BDD scenarios for the build workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BuildContext, build_context};

#[scenario(
    path = "tests/features/build.feature",
    name = "Build a template with an allocated identifier"
)]
fn scenario_allocated_identifier(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Retry when an allocated identifier is taken"
)]
fn scenario_retry_duplicate(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Never retry an explicit identifier"
)]
fn scenario_explicit_identifier(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Tear down after a failed provisioning action"
)]
fn scenario_provision_failure(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Tear down when cancelled while waiting for ssh"
)]
fn scenario_cancelled(build_context: BuildContext) {
    let _ = build_context;
}
