//! User-facing progress reporting.
//!
//! Steps report through [`Ui`]; nothing in the build depends on what an
//! implementation does with the lines.

use std::io::{self, Write};

use tracing::debug;

/// Write-only reporter used by steps.
pub trait Ui: Send + Sync {
    /// Announces progress.
    fn say(&self, message: &str);

    /// Relays output, such as provisioning command output.
    fn message(&self, message: &str);

    /// Reports a failure the user may need to act on.
    fn error(&self, message: &str);
}

/// Writes to stderr and mirrors each line as a debug event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalUi;

impl Ui for TerminalUi {
    fn say(&self, message: &str) {
        debug!(target: "kiln::ui", kind = "say", "{message}");
        write_line(io::stderr(), "==> ", message);
    }

    fn message(&self, message: &str) {
        debug!(target: "kiln::ui", kind = "message", "{message}");
        write_line(io::stderr(), "    ", message);
    }

    fn error(&self, message: &str) {
        debug!(target: "kiln::ui", kind = "error", "{message}");
        write_line(io::stderr(), "==> error: ", message);
    }
}

fn write_line(mut target: impl Write, prefix: &str, message: &str) {
    for line in message.lines() {
        writeln!(target, "{prefix}{line}").ok();
    }
}
