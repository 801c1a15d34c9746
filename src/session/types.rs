//! Process execution primitives shared by the SSH transport and its doubles.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::warn;

use super::SessionError;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit code for messages, `unknown` when the process was
    /// killed by a signal.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Output of a command executed inside the build container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code reported by the remote command, if any.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the remote command exited with zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

impl From<CommandOutput> for RemoteCommandOutput {
    fn from(output: CommandOutput) -> Self {
        Self {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Stream a forwarded output line came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Receives output lines while a command is still running.
pub trait OutputSink: Send + Sync {
    /// Called once per line, without the line terminator.
    fn line(&self, stream: OutputStream, line: &str);
}

/// Sink that drops every line.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardOutput;

impl OutputSink for DiscardOutput {
    fn line(&self, _stream: OutputStream, _line: &str) {}
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, SessionError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, forwarding output lines to
    /// `sink` as they arrive and capturing them in the result.
    ///
    /// Dropping the future stops the process.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Spawn`] if the command cannot be started.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        sink: &'a dyn OutputSink,
    ) -> CommandFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        sink: &'a dyn OutputSink,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            let spawn_error = |err: std::io::Error| SessionError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            };
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(spawn_error)?;

            let (stdout, stderr) = tokio::join!(
                forward_lines(child.stdout.take(), OutputStream::Stdout, sink),
                forward_lines(child.stderr.take(), OutputStream::Stderr, sink),
            );
            let status = child.wait().await.map_err(spawn_error)?;

            Ok(CommandOutput {
                code: status.code(),
                stdout,
                stderr,
            })
        })
    }
}

async fn forward_lines<R>(reader: Option<R>, stream: OutputStream, sink: &dyn OutputSink) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    let mut collected = String::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                sink.line(stream, line.trim_end_matches(['\r', '\n']));
                collected.push_str(&line);
            }
            Err(err) => {
                warn!(?stream, error = %err, "failed to read command output");
                break;
            }
        }
    }
    collected
}
