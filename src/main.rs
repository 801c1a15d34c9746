//! Binary entry point for the kiln CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{ArgMatches, CommandFactory, FromArgMatches};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{BuildCommand, Cli, Command};
use kiln::{
    BuildError, BuildSettings, Builder, ConfigError, ContainerConfig, ProvisionAction,
    ProxmoxClient, ProxmoxConfig, ProxmoxError, SessionError, SshConfig, SshTransport, TerminalUi,
};

/// Exit status used when the build was interrupted.
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("ssh configuration error: {0}")]
    Session(#[from] SessionError),
    #[error("proxmox error: {0}")]
    Proxmox(#[from] ProxmoxError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Build(BuildError::Cancelled) => EXIT_CANCELLED,
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    init_tracing(cli.debug);

    let exit_code = match dispatch(cli, &matches).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("kiln=debug")
    } else {
        EnvFilter::try_from_env("KILN_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("kiln=warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn dispatch(cli: Cli, matches: &ArgMatches) -> Result<(), CliError> {
    match cli.command {
        Command::Build(command) => {
            let actions = matches
                .subcommand_matches("build")
                .map(|build| ordered_actions(build, &command))
                .unwrap_or_default();
            build(command, actions).await
        }
    }
}

async fn build(args: BuildCommand, actions: Vec<ProvisionAction>) -> Result<(), CliError> {
    let mut proxmox_config = ProxmoxConfig::load_without_cli_args()?;
    let mut container_config = ContainerConfig::load_without_cli_args()?;
    let ssh_config = SshConfig::load_without_cli_args()?;
    if let Some(node) = args.node {
        proxmox_config.node = node;
    }
    if let Some(vmid) = args.vmid {
        container_config.vmid = vmid;
    }

    let settings =
        BuildSettings::from_config(&proxmox_config, &container_config, &ssh_config, actions)?;
    let client = ProxmoxClient::connect(&proxmox_config).await?;
    let transport = SshTransport::with_process_runner(ssh_config)?;
    let builder = Builder::new(
        Arc::new(client),
        Arc::new(transport),
        settings,
        Arc::new(TerminalUi),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling build");
            trigger.cancel();
        }
    });

    let artifact = builder.run(cancel).await?;
    writeln!(io::stdout(), "{artifact}").ok();
    Ok(())
}

/// Merges `--provision` and `--script` values back into command-line order.
fn ordered_actions(matches: &ArgMatches, args: &BuildCommand) -> Vec<ProvisionAction> {
    let shells = matches
        .indices_of("provision")
        .into_iter()
        .flatten()
        .zip(args.provision.iter().cloned().map(ProvisionAction::Shell));
    let scripts = matches.indices_of("script").into_iter().flatten().zip(
        args.script
            .iter()
            .map(|path| ProvisionAction::Script(Utf8PathBuf::from(path))),
    );

    let mut indexed: Vec<_> = shells.chain(scripts).collect();
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, action)| action).collect()
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
