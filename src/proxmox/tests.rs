//! Tests for the Proxmox API client against a mock server.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ProxmoxClient, ProxmoxError};
use crate::backend::{Backend, BackendErrorKind, ContainerSpec, VmId, VmRef};
use crate::config::ProxmoxConfig;
use crate::runner::{RunOutcome, Step, StepAction};
use crate::state::BuildState;
use crate::steps::CreateContainer;
use crate::test_support::RecordingUi;

const BASE: &str = "/api2/json";
const UPID: &str = "UPID:pve1:0000A1B2:vzcreate:100:root@pam:";

fn config(server: &MockServer) -> ProxmoxConfig {
    ProxmoxConfig {
        url: server.url(BASE),
        username: String::from("ci@pve!kiln"),
        password: None,
        token: Some(String::from("s3cret")),
        node: String::from("pve1"),
        skip_cert_validation: false,
        task_timeout_secs: 5,
    }
}

async fn token_client(server: &MockServer) -> ProxmoxClient {
    ProxmoxClient::connect(&config(server))
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"))
        .with_poll_interval(Duration::from_millis(5))
}

fn spec() -> ContainerSpec {
    ContainerSpec::builder()
        .hostname("builder")
        .os_template("local:vztmpl/debian-12.tar.zst")
        .start(true)
        .build()
        .unwrap_or_else(|err| panic!("spec: {err}"))
}

fn vm_ref() -> VmRef {
    VmRef::new(VmId::new(100), "pve1")
}

async fn mock_task<'a>(server: &'a MockServer, status: &str, exit: &str) -> httpmock::Mock<'a> {
    let body = json!({ "data": { "status": status, "exitstatus": exit } });
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{BASE}/nodes/pve1/tasks/{UPID}/status"));
            then.status(200).json_body(body);
        })
        .await
}

#[tokio::test]
async fn next_id_sends_token_header_and_parses_string_identifier() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{BASE}/cluster/nextid"))
                .header("authorization", "PVEAPIToken=ci@pve!kiln=s3cret");
            then.status(200).json_body(json!({ "data": "105" }));
        })
        .await;

    let client = token_client(&server).await;
    let id = client
        .next_id(None)
        .await
        .unwrap_or_else(|err| panic!("next_id: {err}"));

    assert_eq!(id, VmId::new(105));
    mock.assert_async().await;
}

#[tokio::test]
async fn next_id_forwards_hint_as_query() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{BASE}/cluster/nextid"))
                .query_param("vmid", "200");
            then.status(200).json_body(json!({ "data": 200 }));
        })
        .await;

    let client = token_client(&server).await;
    let id = client
        .next_id(Some(VmId::new(200)))
        .await
        .unwrap_or_else(|err| panic!("next_id: {err}"));

    assert_eq!(id, VmId::new(200));
    mock.assert_async().await;
}

#[tokio::test]
async fn create_waits_for_task_completion() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/nodes/pve1/lxc"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    let task = mock_task(&server, "stopped", "OK").await;

    let client = token_client(&server).await;
    let reference = vm_ref();
    let status = client
        .create_container(&reference, &spec())
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(status.upid, UPID);
    assert_eq!(status.exit_status, "OK");
    create.assert_async().await;
    task.assert_async().await;
}

#[tokio::test]
async fn create_classifies_taken_identifier_as_duplicate() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/nodes/pve1/lxc"));
            then.status(500).json_body(json!({
                "data": null,
                "message": "unable to create CT 100 - CT 100 already exists on node 'pve1'\n"
            }));
        })
        .await;

    let client = token_client(&server).await;
    let reference = vm_ref();
    let err = client
        .create_container(&reference, &spec())
        .await
        .expect_err("create should fail");

    assert!(err.is_duplicate_id(), "unexpected error: {err}");
    assert_eq!(
        err,
        ProxmoxError::DuplicateId {
            vmid: 100,
            node: String::from("pve1"),
        }
    );
}

#[tokio::test]
async fn create_keeps_other_api_failures() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/nodes/pve1/lxc"));
            then.status(400).json_body(json!({
                "data": null,
                "errors": { "ostemplate": "no such volume" }
            }));
        })
        .await;

    let client = token_client(&server).await;
    let reference = vm_ref();
    let err = client
        .create_container(&reference, &spec())
        .await
        .expect_err("create should fail");

    assert!(!err.is_duplicate_id());
    match err {
        ProxmoxError::Api {
            status, message, ..
        } => {
            assert_eq!(status, 400);
            assert_eq!(message, "ostemplate: no such volume");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn failed_task_surfaces_exit_status() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("{BASE}/nodes/pve1/lxc/100/status/stop"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    mock_task(&server, "stopped", "command 'lxc-stop' failed").await;

    let client = token_client(&server).await;
    let err = client
        .stop(&vm_ref())
        .await
        .expect_err("stop should fail");

    assert_eq!(
        err,
        ProxmoxError::TaskFailed {
            upid: String::from(UPID),
            exit_status: String::from("command 'lxc-stop' failed"),
        }
    );
}

#[tokio::test]
async fn running_task_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("{BASE}/nodes/pve1/lxc/100/status/shutdown"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    mock_task(&server, "running", "").await;

    let mut client = token_client(&server).await;
    client.task_timeout = Duration::from_millis(30);
    let err = client
        .shutdown(&vm_ref())
        .await
        .expect_err("shutdown should time out");

    assert_eq!(
        err,
        ProxmoxError::TaskTimeout {
            upid: String::from(UPID),
        }
    );
}

#[tokio::test]
async fn create_that_never_finishes_is_still_torn_down() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/nodes/pve1/lxc"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("{BASE}/nodes/pve1/lxc/100/status/stop"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("{BASE}/nodes/pve1/lxc/100"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    mock_task(&server, "running", "").await;

    let mut client = token_client(&server).await;
    client.task_timeout = Duration::from_millis(30);
    let step = CreateContainer::new(
        Arc::new(client),
        spec(),
        VmId::new(100),
        "pve1",
        Arc::new(RecordingUi::default()),
    );
    let mut state: BuildState<()> = BuildState::new(CancellationToken::new());

    let action = step.run(&mut state).await;
    assert_eq!(action, StepAction::Halt);
    assert_eq!(state.vm_ref(), Some(&vm_ref()));
    step.cleanup(&mut state, RunOutcome::Halted).await;

    delete.assert_async().await;
}

#[tokio::test]
async fn timed_out_create_is_unconfirmed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/nodes/pve1/lxc"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    mock_task(&server, "running", "").await;

    let mut client = token_client(&server).await;
    client.task_timeout = Duration::from_millis(30);
    let err = client
        .create_container(&vm_ref(), &spec())
        .await
        .expect_err("create should time out");

    assert!(err.is_unconfirmed(), "unexpected error: {err}");
    assert!(!err.is_duplicate_id());
}

#[tokio::test]
async fn convert_without_task_returns_immediately() {
    let server = MockServer::start_async().await;
    let convert = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("{BASE}/nodes/pve1/lxc/100/template"));
            then.status(200).json_body(json!({ "data": null }));
        })
        .await;

    let client = token_client(&server).await;
    client
        .convert_to_template(&vm_ref())
        .await
        .unwrap_or_else(|err| panic!("convert: {err}"));

    convert.assert_async().await;
}

#[tokio::test]
async fn delete_issues_delete_request() {
    let server = MockServer::start_async().await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("{BASE}/nodes/pve1/lxc/100"));
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    mock_task(&server, "stopped", "OK").await;

    let client = token_client(&server).await;
    client
        .delete(&vm_ref())
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));

    delete.assert_async().await;
}

#[tokio::test]
async fn password_login_attaches_ticket_and_csrf_token() {
    let server = MockServer::start_async().await;
    let login = server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/access/ticket"));
            then.status(200).json_body(json!({
                "data": {
                    "ticket": "PVE:root@pam:TICKET",
                    "CSRFPreventionToken": "CSRF123",
                    "username": "root@pam"
                }
            }));
        })
        .await;
    let stop = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("{BASE}/nodes/pve1/lxc/100/status/stop"))
                .header("cookie", "PVEAuthCookie=PVE:root@pam:TICKET")
                .header("csrfpreventiontoken", "CSRF123");
            then.status(200).json_body(json!({ "data": UPID }));
        })
        .await;
    mock_task(&server, "stopped", "OK").await;

    let mut settings = config(&server);
    settings.username = String::from("root@pam");
    settings.token = None;
    settings.password = Some(String::from("hunter2"));
    let client = ProxmoxClient::connect(&settings)
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"))
        .with_poll_interval(Duration::from_millis(5));

    client
        .stop(&vm_ref())
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));

    login.assert_async().await;
    stop.assert_async().await;
}

#[tokio::test]
async fn rejected_login_reports_auth_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{BASE}/access/ticket"));
            then.status(401).body("authentication failure");
        })
        .await;

    let mut settings = config(&server);
    settings.token = None;
    settings.password = Some(String::from("wrong"));
    let err = ProxmoxClient::connect(&settings)
        .await
        .expect_err("login should fail");

    assert!(
        matches!(err, ProxmoxError::Auth { .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn connect_rejects_missing_credentials() {
    let server = MockServer::start_async().await;
    let mut settings = config(&server);
    settings.token = None;

    let err = ProxmoxClient::connect(&settings)
        .await
        .expect_err("connect should fail");

    assert!(
        matches!(err, ProxmoxError::Config(ref message) if message.contains("PROXMOX_PASSWORD")),
        "unexpected error: {err}"
    );
}
