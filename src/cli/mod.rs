//! Command-line interface definitions for the `kiln` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `kiln` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Build Proxmox LXC templates from a provisioned container",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log debug output to stderr.
    #[arg(long, global = true)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `kiln`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create a container, provision it, and convert it into a template.
    #[command(
        name = "build",
        about = "Create a container, provision it, and convert it into a template"
    )]
    Build(BuildCommand),
}

/// Arguments for the `kiln build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Use this container identifier instead of asking the hypervisor for one.
    ///
    /// An explicit identifier is never retried when creation fails.
    #[arg(long, value_name = "ID")]
    pub(crate) vmid: Option<u32>,
    /// Override the Proxmox node that hosts the build container.
    #[arg(long, value_name = "NODE")]
    pub(crate) node: Option<String>,
    /// Run a shell command inside the container. May be repeated.
    ///
    /// Commands and scripts run in the order they appear on the command line.
    #[arg(long, value_name = "CMD")]
    pub(crate) provision: Vec<String>,
    /// Run a local script inside the container through `sh -c`. May be repeated.
    #[arg(long, value_name = "PATH")]
    pub(crate) script: Vec<String>,
}
