//! Guest init for dock-fire.
//!
//! Runs as PID 1 inside the Firecracker VM. Mounts the essential
//! filesystems, execs the container command from the config the host baked
//! into the image, relays signals, and reboots the VM when the command
//! exits. The VMM observes the reboot and terminates; that process exit is
//! what the host runtime and the supervisor see as container exit.
//!
//! All output goes to the serial console, which is the container's stdio.

mod config;
mod pid1;

use std::process::Command;
use std::thread;
use std::time::Duration;

use nix::mount::{mount, MsFlags};

fn main() {
    if let Err(e) = run() {
        eprintln!("[dock-fire-init] {e}");
    }
    reboot_vm();
}

fn run() -> Result<(), String> {
    mount_essentials();
    ensure_resolv_conf();

    let data = std::fs::read_to_string(config::CONFIG_PATH)
        .map_err(|e| format!("read {}: {e}", config::CONFIG_PATH))?;
    let cfg = config::parse(&data)?;

    if !cfg.cwd.is_empty() {
        std::env::set_current_dir(&cfg.cwd).map_err(|e| format!("chdir {}: {e}", cfg.cwd))?;
    }

    let env = config::effective_env(&cfg);
    let program = config::resolve_program(&cfg.args[0], config::path_var(&env))
        .ok_or_else(|| format!("resolve command {:?}: not found in PATH", cfg.args[0]))?;

    // Handlers must be in place before the child exists so no signal falls
    // into the gap; exec resets the child's dispositions to default.
    pid1::install_forwarders();

    let child = Command::new(&program)
        .args(&cfg.args[1..])
        .env_clear()
        .envs(config::env_pairs(&env))
        .spawn()
        .map_err(|e| format!("start command {}: {e}", program.display()))?;
    let child_pid = child.id() as i32;

    // Relay-and-reap loop: forward anything we caught, reap orphans, watch
    // for the child's exit.
    loop {
        for sig in pid1::drain_pending() {
            pid1::forward(child_pid, sig);
        }
        if let Some(code) = pid1::reap_zombies(child_pid) {
            eprintln!("[dock-fire-init] command exited with code {code}");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Mount /proc, /sys, /dev. The kernel boots us with only the root ext4;
/// a failure here is logged but the command may still be runnable.
fn mount_essentials() {
    let mounts: [(&str, &str, &str); 3] = [
        ("proc", "/proc", "proc"),
        ("sysfs", "/sys", "sysfs"),
        ("devtmpfs", "/dev", "devtmpfs"),
    ];
    for (source, target, fstype) in mounts {
        let _ = std::fs::create_dir_all(target);
        if let Err(e) = mount(
            Some(source),
            target,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        ) {
            eprintln!("[dock-fire-init] mount {target}: {e}");
        }
    }
}

/// Supervisors building `--net=none` bundles ship an empty resolv.conf;
/// give the guest working DNS in that case.
fn ensure_resolv_conf() {
    let needs_default = match std::fs::read("/etc/resolv.conf") {
        Ok(data) => data.is_empty(),
        Err(_) => true,
    };
    if needs_default {
        let _ = std::fs::write(
            "/etc/resolv.conf",
            "nameserver 8.8.8.8\nnameserver 8.8.4.4\n",
        );
    }
}

/// Sync and reboot the VM. Firecracker treats the guest reboot as VM exit.
fn reboot_vm() -> ! {
    nix::unistd::sync();
    let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT);
    // Unreachable as PID 1; in any other context reboot(2) fails and the
    // process just exits.
    std::process::exit(0);
}
