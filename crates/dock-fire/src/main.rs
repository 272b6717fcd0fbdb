//! dock-fire: an OCI runtime that boots each container inside a dedicated
//! Firecracker microVM. Invoked by a container supervisor once per verb.

mod cmd;
mod command;
mod container;
mod error;
mod image;
mod network;
mod oci;
mod vmm;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

#[derive(Parser)]
#[command(
    name = "dock-fire",
    version,
    about = "OCI runtime that boots containers inside Firecracker microVMs"
)]
struct Cli {
    /// Root directory for container state
    #[arg(long, global = true, default_value = "/run/dock-fire")]
    root: PathBuf,

    /// Log file path (default: stderr)
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Log format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Accepted for OCI compatibility; cgroups are a host concern dock-fire
    /// does not have
    #[arg(long, global = true, hide = true)]
    systemd_cgroup: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create a container
    Create(cmd::CreateArgs),
    /// Start a created container
    Start(cmd::StartArgs),
    /// Output the state of a container
    State(cmd::StateArgs),
    /// Send a signal to a container
    Kill(cmd::KillArgs),
    /// Delete a container
    Delete(cmd::DeleteArgs),
}

/// Route logs to stderr or the `--log` file. stdout stays untouched: in
/// non-TTY mode it is the container's console and belongs to the VMM.
fn init_tracing(cli: &Cli) -> Result<(), String> {
    let level = if cli.debug { Level::DEBUG } else { Level::WARN };

    match &cli.log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("open log file {}: {e}", path.display()))?;
            let writer = Mutex::new(file);
            match cli.log_format {
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init(),
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_max_level(level)
                    .with_writer(writer)
                    .init(),
            }
        }
        None => match cli.log_format {
            LogFormat::Text => tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init(),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("dock-fire: {e}");
        return ExitCode::FAILURE;
    }

    let root = cli.root.clone();
    let result = match cli.command {
        Command::Create(args) => cmd::run_create(&root, args).await,
        Command::Start(args) => cmd::run_start(&root, args).await,
        Command::State(args) => cmd::run_state(&root, args).await,
        Command::Kill(args) => cmd::run_kill(&root, args).await,
        Command::Delete(args) => cmd::run_delete(&root, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dock-fire: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_the_oci_invocation_shape() {
        let cli = Cli::try_parse_from([
            "dock-fire",
            "--root",
            "/run/test",
            "--log",
            "/tmp/log",
            "--log-format",
            "json",
            "create",
            "--bundle",
            "/b",
            "--pid-file",
            "/tmp/pid",
            "c1",
        ])
        .unwrap();
        assert_eq!(cli.root, PathBuf::from("/run/test"));
        assert!(matches!(cli.command, Command::Create(_)));
    }

    #[test]
    fn cli_accepts_hidden_compat_flags() {
        Cli::try_parse_from(["dock-fire", "--systemd-cgroup", "create", "--no-pivot", "c1"])
            .unwrap();
    }

    #[test]
    fn cli_accepts_global_flags_after_the_verb() {
        let cli = Cli::try_parse_from(["dock-fire", "state", "--root", "/r", "c1"]).unwrap();
        assert_eq!(cli.root, PathBuf::from("/r"));
    }

    #[test]
    fn kill_takes_an_optional_signal_positional() {
        let cli = Cli::try_parse_from(["dock-fire", "kill", "--all", "c1", "9"]).unwrap();
        assert!(matches!(cli.command, Command::Kill(_)));

        Cli::try_parse_from(["dock-fire", "kill", "c1"]).unwrap();
    }

    #[test]
    fn delete_takes_force() {
        Cli::try_parse_from(["dock-fire", "delete", "--force", "c1"]).unwrap();
    }

    #[test]
    fn root_defaults_to_run_dock_fire() {
        let cli = Cli::try_parse_from(["dock-fire", "state", "c1"]).unwrap();
        assert_eq!(cli.root, PathBuf::from("/run/dock-fire"));
    }
}
