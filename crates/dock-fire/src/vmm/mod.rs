//! Firecracker process management: launch with inherited stdio, wait for the
//! control API, capture the pid, and stop with escalation.

pub mod api;
pub mod config;
mod console;

use std::io::Write;
use std::os::fd::AsFd;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use oci_spec::runtime::Spec;
use tracing::debug;

pub use api::ApiError;

use crate::container::Container;
use crate::error::{Result, RuntimeError};

pub const FIRECRACKER_BIN: &str = "firecracker";

/// How long the control API gets to come up after spawn. Firecracker binds
/// its socket in milliseconds; this only trips when the VMM dies on boot.
const API_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Boot a Firecracker VM for the container and record the VMM pid.
///
/// The child must outlive this process: its stdio is inherited OS file
/// descriptors (or a PTY slave in TTY mode), never a userspace relay. A
/// relay thread would die with the runtime and truncate the container's
/// output mid-stream.
pub async fn start(ctr: &mut Container, spec: &Spec, console_socket: Option<&Path>) -> Result<()> {
    let socket_path = config::socket_path(&ctr.id);
    remove_stale_socket(Path::new(&socket_path))?;
    ctr.socket_path = socket_path;

    let state_dir = ctr.state_dir();
    let vm_config = config::build(ctr, spec);
    let config_path = state_dir.join("vm-config.json");
    let config_data = serde_json::to_vec_pretty(&vm_config)
        .map_err(|e| RuntimeError::Internal(format!("marshal VM config: {e}")))?;
    std::fs::write(&config_path, config_data)
        .map_err(|e| RuntimeError::io(format!("write {}", config_path.display()), e))?;

    // Firecracker refuses to start if its --log-path target is missing.
    let log_path = state_dir.join("vm-log.log");
    std::fs::File::create(&log_path)
        .map_err(|e| RuntimeError::io(format!("create {}", log_path.display()), e))?;

    // The VMM's stderr plus this launcher's own notes, kept out of the
    // serial console stream.
    let stderr_path = state_dir.join("vm-stderr.log");
    let mut stderr_file = std::fs::File::create(&stderr_path)
        .map_err(|e| RuntimeError::io(format!("create {}", stderr_path.display()), e))?;
    let _ = writeln!(stderr_file, "boot args: {}", config::boot_args(ctr));

    // TTY mode: the supervisor gets the PTY master over its console socket
    // and the VMM gets the slave. Otherwise the VMM inherits this process's
    // own stdin/stdout, which are the supervisor shim's pipes.
    let (stdin, stdout, slave) = match console_socket {
        Some(sock) => {
            let (master, slave) = console::open_pty()?;
            console::send_console_fd(sock, master.as_fd())?;
            drop(master); // the supervisor owns the master now
            let stdin_fd = slave
                .try_clone()
                .map_err(|e| RuntimeError::Internal(format!("dup pty slave: {e}")))?;
            let stdout_fd = slave
                .try_clone()
                .map_err(|e| RuntimeError::Internal(format!("dup pty slave: {e}")))?;
            (Stdio::from(stdin_fd), Stdio::from(stdout_fd), Some(slave))
        }
        None => (Stdio::inherit(), Stdio::inherit(), None),
    };

    let mut child = Command::new(FIRECRACKER_BIN)
        .arg("--api-sock")
        .arg(&ctr.socket_path)
        .arg("--config-file")
        .arg(&config_path)
        .arg("--log-path")
        .arg(&log_path)
        .arg("--level")
        .arg("Error")
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .map_err(|e| RuntimeError::Internal(format!("spawn {FIRECRACKER_BIN}: {e}")))?;

    // The child inherited the slave; close our copy.
    drop(slave);

    if let Err(e) = api::wait_for_ready(Path::new(&ctr.socket_path), API_READY_TIMEOUT).await {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e.into());
    }

    ctr.pid = child.id() as i32;
    debug!(pid = ctr.pid, "VM started");
    Ok(())
}

/// Terminate the VMM: SIGTERM, a short grace, then SIGKILL if it is still
/// there. Errors are swallowed; a missing process is already stopped.
pub async fn stop(ctr: &Container) {
    if ctr.pid <= 0 {
        return;
    }
    let pid = Pid::from_raw(ctr.pid);
    if kill(pid, Signal::SIGTERM).is_err() {
        return;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    if kill(pid, None).is_ok() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RuntimeError::io(format!("remove {}", path.display()), e)),
    }
}
