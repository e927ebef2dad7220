//! `inserv-client`: query and drive instrument servers from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rust_inserv::config::ClientConfig;
use rust_inserv::logging;
use rust_inserv::manager::InstrumentManager;
use rust_inserv::value::AttrValue;

/// Discover instrument servers and access their devices
///
/// Configuration values can be overridden with `INSERV_CLIENT_` environment
/// variables, e.g. `INSERV_CLIENT_CONNECT_TIMEOUT_SECS=2`.
#[derive(Parser, Debug)]
#[command(name = "inserv-client", version, about, long_about = None)]
struct Cli {
    /// Client configuration file (optional)
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Service registry to discover servers in, overriding the configuration:
    /// a redis URL (`redis://host:6379/0`) or a directory
    #[arg(short, long)]
    registry: Option<String>,

    /// Verbosity of logging: debug, info, warning, error
    #[arg(short, long, default_value = "warning")]
    verbosity: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected servers and their devices
    List,
    /// Show the attributes of a device
    Attrs {
        /// Qualified device id, e.g. lab1/sg
        device: String,
    },
    /// Read an attribute
    Get {
        /// Qualified device id, e.g. lab1/sg
        device: String,
        attribute: String,
    },
    /// Write an attribute, e.g. `set lab1/sg amplitude 1.5 V`
    Set {
        /// Qualified device id, e.g. lab1/sg
        device: String,
        attribute: String,
        /// Literal: true/false, number, quantity ("1.5 V") or text
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("inserv-client: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let _log_guard = logging::init_tracing(&cli.verbosity, None)?;

    let mut config = ClientConfig::load_from(&cli.config)
        .with_context(|| format!("cannot load configuration {}", cli.config.display()))?;
    if let Some(descriptor) = &cli.registry {
        config.registry.set_descriptor(descriptor);
    }
    let mut manager = InstrumentManager::from_config(&config).await?;

    let result = execute(&manager, cli.command).await;
    manager.shutdown().await?;
    result
}

async fn execute(manager: &InstrumentManager, command: Command) -> Result<()> {
    match command {
        Command::List => {
            for server in manager.servers() {
                println!("{} ({}:{})", server.server_id, server.address, server.port);
                for device in &server.devices {
                    println!("  {}/{device}", server.server_id);
                }
            }
        }
        Command::Attrs { device } => {
            for attribute in manager.device(&device)?.attributes().await? {
                let access = if attribute.writable { "rw" } else { "ro" };
                match attribute.unit {
                    Some(unit) => println!("{:<16} {access} [{unit}]", attribute.name),
                    None => println!("{:<16} {access}", attribute.name),
                }
            }
        }
        Command::Get { device, attribute } => {
            let value = manager.device(&device)?.get(&attribute).await?;
            println!("{value}");
        }
        Command::Set {
            device,
            attribute,
            value,
        } => {
            let literal = value.join(" ");
            let value = AttrValue::parse_literal(&literal, manager.units())
                .with_context(|| format!("cannot parse value '{literal}'"))?;
            manager.device(&device)?.set(&attribute, value).await?;
        }
    }
    Ok(())
}
