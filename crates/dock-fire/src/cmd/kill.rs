use std::path::Path;

use clap::Args;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::container::{self, Status};
use crate::error::{Result, RuntimeError};

#[derive(Args)]
pub struct KillArgs {
    /// Send the signal to all processes (ignored, the VM is one process tree)
    #[arg(long)]
    all: bool,

    /// Your name for the instance of the container
    container_id: String,

    /// Signal name or number (default TERM)
    signal: Option<String>,
}

/// Deliver a signal to the VMM process. The VM runs from `create` onwards,
/// so both `created` and `running` accept signals.
pub async fn run_kill(root: &Path, args: KillArgs) -> Result<()> {
    let id = &args.container_id;
    let sig_str = args.signal.as_deref().unwrap_or("TERM");
    debug!(%id, signal = sig_str, "kill");

    let ctr = container::load(root, id)?;

    let status = ctr.effective_status();
    if status != Status::Running && status != Status::Created {
        return Err(RuntimeError::InvalidState {
            id: id.clone(),
            expected: "created or running",
            actual: status.to_string(),
        });
    }

    let sig = parse_signal(sig_str)?;
    kill(Pid::from_raw(ctr.pid), sig)
        .map_err(|e| RuntimeError::Internal(format!("kill VMM process {}: {e}", ctr.pid)))?;

    info!(%id, pid = ctr.pid, signal = sig_str, "signal sent");
    Ok(())
}

/// Accepts `TERM`, `term`, `SIGTERM`, `15`, ...
fn parse_signal(s: &str) -> Result<Signal> {
    let upper = s.to_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let sig = match name {
        "HUP" => Signal::SIGHUP,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "KILL" => Signal::SIGKILL,
        "TERM" => Signal::SIGTERM,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        _ => {
            let n: i32 = name
                .parse()
                .map_err(|_| RuntimeError::UnknownSignal(s.to_string()))?;
            Signal::try_from(n).map_err(|_| RuntimeError::UnknownSignal(s.to_string()))?
        }
    };
    Ok(sig)
}
