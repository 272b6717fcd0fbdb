//! Host-side NAT wiring: IPv4 forwarding plus three iptables rules per
//! container. Teardown removes rules with the exact tuple used to add them;
//! iptables `-D` with a changed tuple silently misses.

use tracing::debug;

use super::error::{NetworkError, Result};
use crate::command;

/// The per-container packet-filter rules, as `iptables` argument tuples with
/// the operation (`-A`/`-D`) left out.
fn rules(tap: &str, subnet_cidr: &str, out_iface: &str) -> [Vec<String>; 3] {
    let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    [
        // Masquerade egress from the VM subnet.
        owned(&[
            "-t", "nat", "POSTROUTING", "-s", subnet_cidr, "-o", out_iface, "-j", "MASQUERADE",
        ]),
        // Forward TAP -> default interface.
        owned(&["FORWARD", "-i", tap, "-o", out_iface, "-j", "ACCEPT"]),
        // Forward return traffic for established flows.
        owned(&[
            "FORWARD",
            "-i",
            out_iface,
            "-o",
            tap,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
    ]
}

/// Splice the operation in front of the chain name: the chain is the first
/// argument after an optional `-t <table>` pair.
fn with_op(rule: &[String], op: &str) -> Vec<String> {
    let chain_pos = if rule[0] == "-t" { 2 } else { 0 };
    let mut args: Vec<String> = rule[..chain_pos].to_vec();
    args.push(op.to_string());
    args.extend_from_slice(&rule[chain_pos..]);
    args
}

/// Enable forwarding and install the three rules for a container.
///
/// The sysctl and the rules are global, idempotent-to-add mutations; they are
/// not rolled back here on partial failure (the caller deletes the TAP, which
/// is the resource that actually conflicts).
pub async fn setup(tap: &str, subnet_cidr: &str) -> Result<()> {
    let out_iface = detect_default_interface().await?;
    debug!(%out_iface, "using default outbound interface");

    command::run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;

    for rule in rules(tap, subnet_cidr, &out_iface) {
        let args = with_op(&rule, "-A");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        command::run("iptables", &args).await?;
    }
    Ok(())
}

/// Remove the three rules. Best-effort: failures are logged, never returned.
/// The ip_forward sysctl stays enabled.
pub async fn teardown(tap: &str, subnet_cidr: &str) {
    let out_iface = match detect_default_interface().await {
        Ok(iface) => iface,
        Err(e) => {
            debug!("skipping NAT teardown: {e}");
            return;
        }
    };

    for rule in rules(tap, subnet_cidr, &out_iface) {
        let args = with_op(&rule, "-D");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        command::run_ignore_errors("iptables", &args).await;
    }
}

/// The interface carrying the host's default route.
pub async fn detect_default_interface() -> Result<String> {
    let out = command::run("ip", &["route", "show", "default"]).await?;
    parse_default_interface(&out).ok_or(NetworkError::NoDefaultInterface(out))
}

/// Parse `default via X.X.X.X dev <iface> ...`.
fn parse_default_interface(route_output: &str) -> Option<String> {
    let fields: Vec<&str> = route_output.split_whitespace().collect();
    fields
        .windows(2)
        .find(|pair| pair[0] == "dev")
        .map(|pair| pair[1].to_string())
}
