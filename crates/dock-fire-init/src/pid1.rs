//! PID 1 signal plumbing: record every catchable signal for relay to the
//! child, reap zombies, report the child's exit.
//!
//! Uses `sigaction` (not `signal`) for reliable, non-resetting handlers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bitmask of signals received since the last drain; bit N = signal N.
/// Signal numbers on Linux fit comfortably in 1..=31 here.
static PENDING_SIGNALS: AtomicU64 = AtomicU64::new(0);

extern "C" fn record_signal(sig: libc::c_int) {
    if (1..64).contains(&sig) {
        PENDING_SIGNALS.fetch_or(1 << sig, Ordering::SeqCst);
    }
}

/// Install a `sigaction` handler with `SA_RESTART`.
fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) {
    // SAFETY: zeroed sigaction is valid; we fill sa_sigaction and sa_flags.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = libc::SA_RESTART;
    // SAFETY: sa is properly initialized, sig is a valid signal number.
    unsafe {
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Catch every forwardable signal. SIGKILL and SIGSTOP cannot be caught;
/// exec resets caught dispositions, so the child starts with defaults.
pub fn install_forwarders() {
    for sig in 1..=31 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        set_handler(sig, record_signal as *const () as libc::sighandler_t);
    }
}

/// Take and clear the pending set, returning the signal numbers.
pub fn drain_pending() -> Vec<i32> {
    let mask = PENDING_SIGNALS.swap(0, Ordering::SeqCst);
    (1..64).filter(|sig| mask & (1 << sig) != 0).collect()
}

/// Relay a signal to the child; a dead child is not an error here.
pub fn forward(child_pid: i32, sig: i32) {
    // SAFETY: plain kill(2); failure (ESRCH after child exit) is ignored.
    unsafe {
        libc::kill(child_pid, sig);
    }
}

/// Reap zombies (non-blocking) and detect the watched child's exit.
///
/// As PID 1 this process inherits every orphan in the VM; `waitpid(-1,
/// WNOHANG)` reaps them all, and only the watched pid's status is reported.
pub fn reap_zombies(watched_pid: i32) -> Option<i32> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid(-1) is valid; status is written on success.
        let result = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        // result > 0: reaped a zombie; 0: none ready; < 0: no children.
        if result <= 0 {
            return None;
        }
        if result == watched_pid {
            return Some(exit_code(status));
        }
        // Orphaned zombie, reaped and discarded.
    }
}

fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}
