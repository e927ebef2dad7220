//! `inserv`: run an instrument server with its operator shell.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use rust_inserv::drivers::DriverCatalog;
use rust_inserv::logging;
use rust_inserv::server::{shell, InstrumentServer};

/// Run an instrument server
///
/// Configuration values can be overridden with `INSERV_` environment
/// variables, e.g. `INSERV_REGISTRY__PATH=/mnt/registry`.
#[derive(Parser, Debug)]
#[command(name = "inserv", version, about, long_about = None)]
struct Cli {
    /// Server configuration file
    #[arg(short, long, default_value = "config/inserv.toml")]
    config: PathBuf,

    /// Service registry to advertise in, overriding the configuration:
    /// a redis URL (`redis://host:6379/0`) or a directory
    #[arg(short, long)]
    registry: Option<String>,

    /// Also log to the provided file location (truncated at startup)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Disable logging
    #[arg(short, long)]
    quiet: bool,

    /// Verbosity of logging: debug, info, warning, error
    #[arg(short, long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("inserv: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let _log_guard = if cli.quiet {
        None
    } else {
        logging::init_tracing(&cli.verbosity, cli.log.as_deref())?
    };

    info!("starting instrument server...");
    let mut server = InstrumentServer::from_path(&cli.config, DriverCatalog::with_builtin())
        .with_context(|| format!("cannot load configuration {}", cli.config.display()))?;
    if let Some(descriptor) = &cli.registry {
        server
            .override_registry(descriptor)
            .with_context(|| format!("invalid registry '{descriptor}'"))?;
    }

    let addr = match server.startup().await {
        Ok(addr) => addr,
        Err(e) => {
            if let Err(cleanup) = server.shutdown().await {
                warn!(error = %cleanup, "Cleanup after failed startup reported errors");
            }
            return Err(e).context("cannot start the instrument server");
        }
    };
    println!("instrument server '{}' started on {addr}...", server.name());

    shell::run_shell(&mut server).await?;

    // No-op after `quit`; covers the input thread failing early.
    server.shutdown().await?;
    Ok(())
}
