//! Test support utilities shared across unit and integration tests.
//!
//! The doubles record every call so tests can assert on ordering without
//! touching a hypervisor, spawning `ssh` or writing to the terminal.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    Backend, BackendErrorKind, BackendFuture, ContainerSpec, TaskStatus, VmId, VmRef,
};
use crate::session::{
    CommandFuture, CommandOutput, CommandRunner, OutputSink, OutputStream, RemoteCommandOutput,
    Session, SessionError, SessionFuture, SessionTarget, Transport,
};
use crate::ui::Ui;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn forward(sink: &dyn OutputSink, stdout: &str, stderr: &str) {
    for line in stdout.lines() {
        sink.line(OutputStream::Stdout, line);
    }
    for line in stderr.lines() {
        sink.line(OutputStream::Stderr, line);
    }
}

#[derive(Clone, Debug)]
enum ScriptedResponse {
    Output(CommandOutput),
    Hang,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Scripted stdout and stderr lines are forwarded to the sink before the
/// output is returned.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(ScriptedResponse::Output(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a response that never completes, as a command stuck on an
    /// unresponsive peer would.
    pub fn push_hang(&self) {
        lock(&self.responses).push_back(ScriptedResponse::Hang);
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        sink: &'a dyn OutputSink,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            lock(&self.invocations).push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
            let response = lock(&self.responses).pop_front();
            match response {
                Some(ScriptedResponse::Output(output)) => {
                    forward(sink, &output.stdout, &output.stderr);
                    Ok(output)
                }
                Some(ScriptedResponse::Hang) => std::future::pending().await,
                None => Err(SessionError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

/// Failure returned by [`ScriptedBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedBackendError {
    /// The identifier was claimed by another actor.
    #[error("container {0} already exists")]
    Duplicate(u32),
    /// The request was accepted but its outcome was never observed.
    #[error("creation of container {0} was not confirmed")]
    Unconfirmed(u32),
    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl BackendErrorKind for ScriptedBackendError {
    fn is_duplicate_id(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    fn is_unconfirmed(&self) -> bool {
        matches!(self, Self::Unconfirmed(_))
    }
}

/// A call observed by [`ScriptedBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendCall {
    /// `next_id` with its hint.
    NextId(Option<VmId>),
    /// `create_container` for a reference.
    Create(VmRef),
    /// `stop`.
    Stop(VmRef),
    /// `shutdown`.
    Shutdown(VmRef),
    /// `convert_to_template`.
    Convert(VmRef),
    /// `delete`.
    Delete(VmRef),
}

impl BackendCall {
    /// Returns a short name for ordering assertions.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NextId(_) => "next_id",
            Self::Create(_) => "create",
            Self::Stop(_) => "stop",
            Self::Shutdown(_) => "shutdown",
            Self::Convert(_) => "convert",
            Self::Delete(_) => "delete",
        }
    }
}

type Scripted = VecDeque<Result<(), ScriptedBackendError>>;

#[derive(Debug, Default)]
struct BackendScript {
    next_ids: VecDeque<u32>,
    creates: Scripted,
    stops: Scripted,
    shutdowns: Scripted,
    converts: Scripted,
    deletes: Scripted,
    calls: Vec<BackendCall>,
    hang_on_shutdown: bool,
}

/// Backend double. Identifiers come from a queue; every other operation
/// succeeds unless a failure was queued for it.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<BackendScript>,
}

fn task(vm_ref: &VmRef, operation: &str) -> TaskStatus {
    TaskStatus {
        upid: format!("UPID:{}:{operation}:{}", vm_ref.node, vm_ref.id),
        exit_status: String::from("OK"),
    }
}

impl ScriptedBackend {
    /// Creates a backend with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues identifiers handed out by `next_id`.
    pub fn push_next_ids(&self, ids: impl IntoIterator<Item = u32>) {
        lock(&self.script).next_ids.extend(ids);
    }

    /// Queues the result of the next create.
    pub fn push_create(&self, result: Result<(), ScriptedBackendError>) {
        lock(&self.script).creates.push_back(result);
    }

    /// Queues the result of the next stop.
    pub fn push_stop(&self, result: Result<(), ScriptedBackendError>) {
        lock(&self.script).stops.push_back(result);
    }

    /// Queues the result of the next shutdown.
    pub fn push_shutdown(&self, result: Result<(), ScriptedBackendError>) {
        lock(&self.script).shutdowns.push_back(result);
    }

    /// Makes every shutdown wait forever, as a task that never stops would.
    pub fn hang_on_shutdown(&self) {
        lock(&self.script).hang_on_shutdown = true;
    }

    /// Queues the result of the next conversion.
    pub fn push_convert(&self, result: Result<(), ScriptedBackendError>) {
        lock(&self.script).converts.push_back(result);
    }

    /// Queues the result of the next delete.
    pub fn push_delete(&self, result: Result<(), ScriptedBackendError>) {
        lock(&self.script).deletes.push_back(result);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.script).calls.clone()
    }

    /// Returns how many identifiers were requested.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, BackendCall::NextId(_)))
            .count()
    }

    /// Returns the references passed to `create_container`.
    #[must_use]
    pub fn creates(&self) -> Vec<VmRef> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Create(vm_ref) => Some(vm_ref),
                _ => None,
            })
            .collect()
    }

    /// Returns the references passed to `delete`.
    #[must_use]
    pub fn deletes(&self) -> Vec<VmRef> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Delete(vm_ref) => Some(vm_ref),
                _ => None,
            })
            .collect()
    }

    fn record(
        &self,
        call: BackendCall,
        pick: fn(&mut BackendScript) -> &mut Scripted,
    ) -> Result<(), ScriptedBackendError> {
        let mut script = lock(&self.script);
        script.calls.push(call);
        pick(&mut script).pop_front().unwrap_or(Ok(()))
    }
}

impl Backend for ScriptedBackend {
    type Error = ScriptedBackendError;

    fn next_id(&self, hint: Option<VmId>) -> BackendFuture<'_, VmId, Self::Error> {
        Box::pin(async move {
            let mut script = lock(&self.script);
            script.calls.push(BackendCall::NextId(hint));
            script
                .next_ids
                .pop_front()
                .map(VmId::new)
                .ok_or_else(|| ScriptedBackendError::Failed(String::from("no identifier queued")))
        })
    }

    fn create_container<'a>(
        &'a self,
        vm_ref: &'a VmRef,
        _spec: &'a ContainerSpec,
    ) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Create(vm_ref.clone()), |script| {
                &mut script.creates
            })?;
            Ok(task(vm_ref, "vzcreate"))
        })
    }

    fn stop<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Stop(vm_ref.clone()), |script| &mut script.stops)?;
            Ok(task(vm_ref, "vzstop"))
        })
    }

    fn shutdown<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Shutdown(vm_ref.clone()), |script| {
                &mut script.shutdowns
            })?;
            let hang = lock(&self.script).hang_on_shutdown;
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(task(vm_ref, "vzshutdown"))
        })
    }

    fn convert_to_template<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Convert(vm_ref.clone()), |script| {
                &mut script.converts
            })
        })
    }

    fn delete<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Delete(vm_ref.clone()), |script| {
                &mut script.deletes
            })?;
            Ok(task(vm_ref, "vzdestroy"))
        })
    }
}

#[derive(Debug, Default)]
struct SessionLog {
    responses: VecDeque<RemoteCommandOutput>,
    commands: Vec<String>,
}

/// Shared script behind [`ScriptedSession`]s; outlives the sessions so
/// tests can inspect commands after the run.
#[derive(Clone, Debug, Default)]
pub struct SessionScript {
    log: Arc<Mutex<SessionLog>>,
}

impl SessionScript {
    /// Queues the output of the next command. Unqueued commands succeed
    /// with empty output.
    pub fn push(&self, output: RemoteCommandOutput) {
        lock(&self.log).responses.push_back(output);
    }

    /// Returns the commands run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.log).commands.clone()
    }

    /// Returns a session backed by this script.
    #[must_use]
    pub fn session(&self) -> ScriptedSession {
        ScriptedSession {
            script: self.clone(),
        }
    }
}

/// Session double driven by a [`SessionScript`].
#[derive(Clone, Debug)]
pub struct ScriptedSession {
    script: SessionScript,
}

impl Session for ScriptedSession {
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        sink: &'a dyn OutputSink,
    ) -> SessionFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            let output = {
                let mut log = lock(&self.script.log);
                log.commands.push(command.to_owned());
                log.responses.pop_front().unwrap_or(RemoteCommandOutput {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            };
            forward(sink, &output.stdout, &output.stderr);
            Ok(output)
        })
    }
}

#[derive(Debug, Default)]
struct TransportScript {
    connects: VecDeque<Result<(), SessionError>>,
    targets: Vec<SessionTarget>,
    hang: bool,
}

/// Transport double. Connects succeed unless a failure was queued or the
/// transport was told to hang until cancelled.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<TransportScript>,
    session: SessionScript,
}

impl ScriptedTransport {
    /// Creates a transport whose sessions share a fresh script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next connect.
    pub fn push_connect(&self, result: Result<(), SessionError>) {
        lock(&self.script).connects.push_back(result);
    }

    /// Makes every connect wait until the run is cancelled.
    pub fn hang_on_connect(&self) {
        lock(&self.script).hang = true;
    }

    /// Returns the targets passed to `connect`.
    #[must_use]
    pub fn targets(&self) -> Vec<SessionTarget> {
        lock(&self.script).targets.clone()
    }

    /// Returns the script shared by handed-out sessions.
    #[must_use]
    pub const fn session_script(&self) -> &SessionScript {
        &self.session
    }
}

impl Transport for ScriptedTransport {
    type Session = ScriptedSession;

    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
        cancel: &'a CancellationToken,
    ) -> SessionFuture<'a, Self::Session> {
        Box::pin(async move {
            let (result, hang) = {
                let mut script = lock(&self.script);
                script.targets.push(target.clone());
                (script.connects.pop_front().unwrap_or(Ok(())), script.hang)
            };
            if hang {
                cancel.cancelled().await;
                return Err(SessionError::Cancelled {
                    host: target.host.clone(),
                });
            }
            result.map(|()| self.session.session())
        })
    }
}

/// Severity of a line recorded by [`RecordingUi`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UiLevel {
    /// [`Ui::say`].
    Say,
    /// [`Ui::message`].
    Message,
    /// [`Ui::error`].
    Error,
}

/// Reporter double that keeps every line.
#[derive(Debug, Default)]
pub struct RecordingUi {
    lines: Mutex<Vec<(UiLevel, String)>>,
}

impl RecordingUi {
    /// Returns every recorded line regardless of level.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines)
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Returns the lines relayed through [`Ui::message`].
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.lines_at(UiLevel::Message)
    }

    /// Returns the lines reported through [`Ui::error`].
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.lines_at(UiLevel::Error)
    }

    fn lines_at(&self, wanted: UiLevel) -> Vec<String> {
        lock(&self.lines)
            .iter()
            .filter(|(level, _)| *level == wanted)
            .map(|(_, line)| line.clone())
            .collect()
    }

    fn push(&self, level: UiLevel, message: &str) {
        lock(&self.lines).push((level, message.to_owned()));
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.push(UiLevel::Say, message);
    }

    fn message(&self, message: &str) {
        self.push(UiLevel::Message, message);
    }

    fn error(&self, message: &str) {
        self.push(UiLevel::Error, message);
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
