//! Operator shell of the instrument server.
//!
//! Commands come from a static table ([`COMMANDS`]) that declares each
//! command's arity. A line is parsed into a typed [`Command`] before anything
//! runs, so a wrong argument count never reaches the server.
//!
//! The interactive loop reads lines with `rustyline` on a dedicated input
//! thread and forwards them over a channel, keeping the tokio runtime free to
//! serve RPC clients while the operator is typing. The prompt is shown again
//! only after the previous command finished.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::thread;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::core::InstrumentServer;

/// Prompt shown by the interactive loop.
pub const PROMPT: &str = "inserv > ";

/// Number of arguments a command accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Optional,
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::None => count == 0,
            Arity::One => count == 1,
            Arity::Optional => count <= 1,
        }
    }
}

/// Command identity, independent of arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    List,
    Config,
    Dev,
    DevAll,
    Restart,
    ServerRestart,
    ServerStop,
    ServerStart,
    Quit,
    Help,
}

/// Entry of the command table.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub kind: CommandKind,
    pub arity: Arity,
    pub usage: &'static str,
    pub help: &'static str,
}

/// Every shell command.
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "list",
        kind: CommandKind::List,
        arity: Arity::None,
        usage: "list",
        help: "List the attached devices",
    },
    CommandSpec {
        name: "config",
        kind: CommandKind::Config,
        arity: Arity::Optional,
        usage: "config [path]",
        help: "Reload the server configuration (optionally from another file)",
    },
    CommandSpec {
        name: "dev",
        kind: CommandKind::Dev,
        arity: Arity::One,
        usage: "dev <name>",
        help: "Reload one device from its configuration",
    },
    CommandSpec {
        name: "dev_all",
        kind: CommandKind::DevAll,
        arity: Arity::None,
        usage: "dev_all",
        help: "Reload all configured devices",
    },
    CommandSpec {
        name: "restart",
        kind: CommandKind::Restart,
        arity: Arity::None,
        usage: "restart",
        help: "Reload the configuration and all devices, then restart the endpoint",
    },
    CommandSpec {
        name: "server_restart",
        kind: CommandKind::ServerRestart,
        arity: Arity::None,
        usage: "server_restart",
        help: "Restart the RPC endpoint",
    },
    CommandSpec {
        name: "server_stop",
        kind: CommandKind::ServerStop,
        arity: Arity::None,
        usage: "server_stop",
        help: "Stop the RPC endpoint",
    },
    CommandSpec {
        name: "server_start",
        kind: CommandKind::ServerStart,
        arity: Arity::None,
        usage: "server_start",
        help: "Start the RPC endpoint",
    },
    CommandSpec {
        name: "quit",
        kind: CommandKind::Quit,
        arity: Arity::None,
        usage: "quit",
        help: "Stop the endpoint, release every device and exit",
    },
    CommandSpec {
        name: "help",
        kind: CommandKind::Help,
        arity: Arity::None,
        usage: "help",
        help: "Show this list",
    },
];

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Config(Option<PathBuf>),
    Dev(String),
    DevAll,
    Restart,
    ServerRestart,
    ServerStop,
    ServerStart,
    Quit,
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command '{0}'. Type 'help' for a list of commands.")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let spec = COMMANDS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| ParseError::Unknown(name.to_string()))?;
    if !spec.arity.accepts(args.len()) {
        return Err(ParseError::Usage(spec.usage));
    }

    let command = match spec.kind {
        CommandKind::List => Command::List,
        CommandKind::Config => Command::Config(args.first().map(PathBuf::from)),
        CommandKind::Dev => Command::Dev(args[0].to_string()),
        CommandKind::DevAll => Command::DevAll,
        CommandKind::Restart => Command::Restart,
        CommandKind::ServerRestart => Command::ServerRestart,
        CommandKind::ServerStop => Command::ServerStop,
        CommandKind::ServerStart => Command::ServerStart,
        CommandKind::Quit => Command::Quit,
        CommandKind::Help => Command::Help,
    };
    Ok(Some(command))
}

/// Whether the loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Quit,
}

/// Text printed for a command plus the loop outcome.
#[derive(Debug)]
pub struct ShellReply {
    pub lines: Vec<String>,
    pub outcome: Outcome,
}

impl ShellReply {
    fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            outcome: Outcome::Continue,
        }
    }

    fn line(line: impl Into<String>) -> Self {
        Self::lines(vec![line.into()])
    }

    fn silent() -> Self {
        Self::lines(Vec::new())
    }
}

fn failure(summary: String, error: &crate::error::InservError) -> ShellReply {
    error!(error = %error, "{summary}");
    ShellReply::line(format!("{summary}: {error}"))
}

/// Run one command against the server.
pub async fn execute(server: &mut InstrumentServer, command: Command) -> ShellReply {
    match command {
        Command::List => ShellReply::lines(server.device_names()),
        Command::Config(path) => match server.update_config(path.as_deref()).await {
            Ok(()) => ShellReply::silent(),
            Err(e) => failure("Failed to reload config files".to_string(), &e),
        },
        Command::Dev(name) => match server.reload_device(&name).await {
            Ok(()) => ShellReply::silent(),
            Err(e) => failure(format!("Failed to reload device [{name}]"), &e),
        },
        Command::DevAll => match server.reload_all_devices().await {
            Ok(()) => ShellReply::silent(),
            Err(e) => failure("Failed to reload all devices".to_string(), &e),
        },
        Command::Restart => match server.restart().await {
            Ok(()) => ShellReply::silent(),
            Err(e) => failure("Failed to restart".to_string(), &e),
        },
        Command::ServerRestart => match server.restart_server().await {
            Ok(addr) => ShellReply::line(format!("Endpoint listening on {addr}")),
            Err(e) => failure("Failed to restart server".to_string(), &e),
        },
        Command::ServerStop => match server.stop_server().await {
            Ok(()) => ShellReply::silent(),
            Err(e) => failure("Failed to stop server".to_string(), &e),
        },
        Command::ServerStart => match server.start_server().await {
            Ok(addr) => ShellReply::line(format!("Endpoint listening on {addr}")),
            Err(e) => failure("Failed to start server".to_string(), &e),
        },
        Command::Quit => {
            info!("Exiting...");
            let mut reply = match server.shutdown().await {
                Ok(()) => ShellReply::silent(),
                Err(e) => failure("Errors during shutdown".to_string(), &e),
            };
            reply.outcome = Outcome::Quit;
            reply
        }
        Command::Help => ShellReply::lines(
            COMMANDS
                .iter()
                .map(|spec| format!("{:<16} {}", spec.usage, spec.help))
                .collect(),
        ),
    }
}

/// Parse and execute one line.
pub async fn handle_line(server: &mut InstrumentServer, line: &str) -> ShellReply {
    match parse(line) {
        Ok(Some(command)) => execute(server, command).await,
        Ok(None) => ShellReply::silent(),
        Err(e) => ShellReply::line(e.to_string()),
    }
}

enum Input {
    Line(String),
    Interrupted,
    Eof,
}

/// Interactive loop; returns after `quit`, EOF or Ctrl-C.
pub async fn run_shell(server: &mut InstrumentServer) -> Result<()> {
    let (input_tx, mut input_rx) = mpsc::channel::<Input>(1);
    let (ready_tx, ready_rx) = std_mpsc::channel::<()>();

    let input_thread = thread::spawn(move || -> Result<()> {
        let mut rl = DefaultEditor::new()
            .map_err(|e| anyhow::anyhow!("Failed to initialize readline: {}", e))?;

        loop {
            let input = match rl.readline(PROMPT) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = rl.add_history_entry(line.as_str());
                    }
                    Input::Line(line)
                }
                Err(ReadlineError::Interrupted) => Input::Interrupted,
                Err(ReadlineError::Eof) => Input::Eof,
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    Input::Eof
                }
            };
            if input_tx.blocking_send(input).is_err() {
                break;
            }
            // Wait for the command to finish before prompting again.
            if ready_rx.recv().is_err() {
                break;
            }
        }
        Ok(())
    });

    while let Some(input) = input_rx.recv().await {
        let reply = match input {
            Input::Line(line) => handle_line(server, &line).await,
            Input::Interrupted | Input::Eof => execute(server, Command::Quit).await,
        };
        for line in &reply.lines {
            println!("{line}");
        }
        if reply.outcome == Outcome::Quit {
            break;
        }
        if ready_tx.send(()).is_err() {
            break;
        }
    }

    drop(ready_tx);
    drop(input_rx);
    match input_thread.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Input thread panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse("list"), Ok(Some(Command::List)));
        assert_eq!(parse("  dev   sg "), Ok(Some(Command::Dev("sg".into()))));
        assert_eq!(parse("config"), Ok(Some(Command::Config(None))));
        assert_eq!(
            parse("config /etc/inserv.toml"),
            Ok(Some(Command::Config(Some(PathBuf::from("/etc/inserv.toml")))))
        );
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn arity_is_checked_before_dispatch() {
        assert_eq!(parse("dev"), Err(ParseError::Usage("dev <name>")));
        assert_eq!(parse("dev a b"), Err(ParseError::Usage("dev <name>")));
        assert_eq!(parse("list extra"), Err(ParseError::Usage("list")));
        assert_eq!(parse("config a b"), Err(ParseError::Usage("config [path]")));
    }

    #[test]
    fn unknown_commands_get_a_hint() {
        let err = parse("debug").unwrap_err();
        assert_eq!(err, ParseError::Unknown("debug".into()));
        assert!(err.to_string().contains("help"));
    }

    #[test]
    fn table_names_are_unique() {
        let mut names: Vec<_> = COMMANDS.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COMMANDS.len());
    }
}
