//! Remote sessions to the build container over the system `ssh` client.
//!
//! [`Transport`] opens a [`Session`] once the container accepts connections;
//! steps then run provisioning commands through it and observe remote exit
//! codes unchanged.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod config;
mod types;
mod util;

pub use config::{DEFAULT_SSH_PORT, SessionError, SessionTarget, SshConfig};
pub use types::{
    CommandFuture, CommandOutput, CommandRunner, DiscardOutput, OutputSink, OutputStream,
    ProcessCommandRunner, RemoteCommandOutput,
};
pub use util::expand_tilde;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_COMMAND: &str = "true";

/// Future returned by [`Transport::connect`] and [`Session::run_command`].
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// An open channel for running commands inside the build container.
pub trait Session: Send + Sync {
    /// Runs `command` remotely, forwarding output lines to `sink` while it
    /// runs.
    ///
    /// A non-zero exit is reported through the output, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the command cannot be started.
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        sink: &'a dyn OutputSink,
    ) -> SessionFuture<'a, RemoteCommandOutput>;
}

/// Establishes sessions, blocking until the target is reachable.
pub trait Transport: Send + Sync {
    /// Session type handed out on success.
    type Session: Session + 'static;

    /// Waits until `target` accepts a session, the transport's own deadline
    /// passes, or `cancel` fires.
    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
        cancel: &'a CancellationToken,
    ) -> SessionFuture<'a, Self::Session>;
}

/// Opens sessions with the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshTransport<R: CommandRunner> {
    config: SshConfig,
    runner: R,
    timeout: Duration,
    poll_interval: Duration,
}

impl SshTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SessionError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + Clone> SshTransport<R> {
    /// Creates a transport using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SessionError> {
        config.validate()?;
        let timeout = config.timeout();
        let poll_interval = config.poll_interval();
        Ok(Self {
            config,
            runner,
            timeout,
            poll_interval,
        })
    }

    /// Overrides the connection deadline and polling interval.
    #[must_use]
    pub const fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    async fn wait_until_ready(
        &self,
        target: &SessionTarget,
        cancel: &CancellationToken,
    ) -> Result<SshSession<R>, SessionError> {
        let session = SshSession {
            config: self.config.clone(),
            target: target.clone(),
            runner: self.runner.clone(),
        };
        let deadline = Instant::now() + self.timeout;
        let cancelled = || SessionError::Cancelled {
            host: target.host.clone(),
        };
        let mut last_failure: Option<CommandOutput> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let reachable = tokio::select! {
                () = cancel.cancelled() => return Err(cancelled()),
                reachable = port_accepts(target) => reachable,
            };
            if reachable {
                let output = tokio::select! {
                    () = cancel.cancelled() => return Err(cancelled()),
                    output = session.execute(HANDSHAKE_COMMAND, &DiscardOutput) => output?,
                };
                if output.is_success() {
                    info!(host = %target.host, port = target.port, "ssh session ready");
                    return Ok(session);
                }
                debug!(
                    host = %target.host,
                    status = %output.status_text(),
                    "ssh handshake not ready"
                );
                last_failure = Some(output);
            }

            if Instant::now() + self.poll_interval > deadline {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(cancelled()),
                () = sleep(self.poll_interval) => {}
            }
        }

        Err(last_failure.map_or_else(
            || SessionError::Timeout {
                host: target.host.clone(),
                port: target.port,
            },
            |output| SessionError::HandshakeFailed {
                host: target.host.clone(),
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            },
        ))
    }
}

async fn port_accepts(target: &SessionTarget) -> bool {
    let connect = timeout(
        TCP_CONNECT_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await;
    matches!(connect, Ok(Ok(_)))
}

impl<R> Transport for SshTransport<R>
where
    R: CommandRunner + Clone + 'static,
{
    type Session = SshSession<R>;

    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
        cancel: &'a CancellationToken,
    ) -> SessionFuture<'a, Self::Session> {
        Box::pin(async move { self.wait_until_ready(target, cancel).await })
    }
}

/// Session backed by one `ssh` invocation per command.
#[derive(Clone, Debug)]
pub struct SshSession<R: CommandRunner> {
    config: SshConfig,
    target: SessionTarget,
    runner: R,
}

impl<R: CommandRunner> SshSession<R> {
    /// Returns where this session runs commands.
    #[must_use]
    pub const fn target(&self) -> &SessionTarget {
        &self.target
    }

    async fn execute(
        &self,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<CommandOutput, SessionError> {
        let args = self.build_ssh_args(command);
        self.runner.run(&self.config.ssh_bin, &args, sink).await
    }

    fn build_ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
            OsString::from("-o"),
            OsString::from(format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}")),
        ];

        if let Some(identity) = self.config.identity_path() {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity));
        }

        if self.config.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from(format!(
            "{}@{}",
            self.target.user, self.target.host
        )));
        args.push(OsString::from(command));
        args
    }
}

impl<R: CommandRunner> Session for SshSession<R> {
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        sink: &'a dyn OutputSink,
    ) -> SessionFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            debug!(host = %self.target.host, command, "running remote command");
            self.execute(command, sink)
                .await
                .map(RemoteCommandOutput::from)
        })
    }
}
