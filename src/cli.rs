//! Command-line surface.
//!
//! User programs register their services on an [`Orchestrator`] and hand
//! control to [`Orchestrator::cli`]; this module parses the `start`,
//! `stop` and `reload` subcommands and maps them onto the orchestrator's
//! top-level commands.

use std::ffi::OsString;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use crate::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "miniboss", about = "Orchestrate a local stack of containerized services")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start all services in dependency order
    Start {
        /// Names of services to exclude (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
        /// Network to use (derived from the group name if not specified)
        #[arg(long)]
        network_name: Option<String>,
        /// Timeout for starting a service (seconds)
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Stop all services, dependants first
    Stop {
        /// Names of services to exclude (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
        /// Network to use (derived from the group name if not specified)
        #[arg(long)]
        network_name: Option<String>,
        /// Remove stopped containers and the network
        #[arg(long)]
        remove: bool,
        /// Timeout for stopping a service (seconds)
        #[arg(long, default_value_t = 50)]
        timeout: u64,
    },
    /// Rebuild one service and restart it together with its dependants
    Reload {
        /// The service to reload
        service: String,
        /// Network to use (derived from the group name if not specified)
        #[arg(long)]
        network_name: Option<String>,
        /// Timeout for stopping a service (seconds)
        #[arg(long, default_value_t = 50)]
        timeout: u64,
        /// Remove stopped containers
        #[arg(long)]
        remove: bool,
    },
}

/// Run the CLI against arguments from the environment
pub async fn run(orchestrator: &Orchestrator) -> ExitCode {
    run_from(orchestrator, std::env::args_os()).await
}

/// Run the CLI against explicit arguments
pub async fn run_from<I, T>(orchestrator: &Orchestrator, args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(2);
        }
    };
    let result = match cli.command {
        CliCommand::Start {
            exclude,
            network_name,
            timeout,
        } => orchestrator
            .start(
                &exclude,
                network_name.as_deref(),
                Duration::from_secs(timeout),
            )
            .await
            .map(drop),
        CliCommand::Stop {
            exclude,
            network_name,
            remove,
            timeout,
        } => orchestrator
            .stop(
                &exclude,
                network_name.as_deref(),
                remove,
                Duration::from_secs(timeout),
            )
            .await
            .map(drop),
        CliCommand::Reload {
            service,
            network_name,
            timeout,
            remove,
        } => orchestrator
            .reload(
                &service,
                network_name.as_deref(),
                remove,
                Duration::from_secs(timeout),
            )
            .await
            .map(drop),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}
