//! Per-container network provisioning: a /30 subnet, a TAP device, and NAT
//! rules on the host.

pub mod allocator;
mod error;
mod nat;

use tracing::debug;

pub use error::{NetworkError, Result};

use crate::command;
use crate::container::Container;

/// Prefix shared by every TAP device the runtime creates; the allocator's
/// crash-recovery scan keys off it.
pub const TAP_PREFIX: &str = "df-";

/// TAP device name for a container: `df-` plus the first 8 characters of the
/// id (IFNAMSIZ leaves no room for full-entropy ids).
pub fn tap_name(id: &str) -> String {
    format!("{TAP_PREFIX}{}", id.chars().take(8).collect::<String>())
}

/// Configure networking for a container and record it on the state.
///
/// If anything after TAP creation fails, the TAP is deleted before the error
/// is returned; the allocator must not find it on the next run.
pub async fn setup(ctr: &mut Container) -> Result<()> {
    let subnet = allocator::allocate(&ctr.root_dir).await?;
    let tap = tap_name(&ctr.id);

    create_tap(&tap, &subnet.host_ip.to_string()).await?;

    if let Err(e) = nat::setup(&tap, &subnet.cidr).await {
        delete_tap(&tap).await;
        return Err(e);
    }

    ctr.tap_device = tap;
    ctr.host_ip = subnet.host_ip.to_string();
    ctr.guest_ip = subnet.guest_ip.to_string();
    ctr.subnet_cidr = subnet.cidr;
    debug!(
        tap = %ctr.tap_device,
        host = %ctr.host_ip,
        guest = %ctr.guest_ip,
        "networking configured"
    );
    Ok(())
}

/// Remove a container's network resources. Best-effort: errors are logged,
/// never propagated.
pub async fn teardown(ctr: &Container) {
    if ctr.tap_device.is_empty() {
        return;
    }
    if !ctr.subnet_cidr.is_empty() {
        nat::teardown(&ctr.tap_device, &ctr.subnet_cidr).await;
    }
    delete_tap(&ctr.tap_device).await;
}

/// Teardown with nothing but the container id (state file lost or corrupt).
///
/// The TAP name is derived from the id; its /30, needed for the NAT tuple,
/// is recovered from the live link table before the TAP is removed.
pub async fn teardown_by_id(id: &str) {
    let tap = tap_name(id);
    if let Some(cidr) = subnet_of_tap(&tap).await {
        nat::teardown(&tap, &cidr).await;
    }
    delete_tap(&tap).await;
}

async fn create_tap(name: &str, host_ip: &str) -> Result<()> {
    debug!(%name, %host_ip, "creating TAP device");
    command::run("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).await?;

    let addr = format!("{host_ip}/30");
    if let Err(e) = command::run("ip", &["addr", "add", &addr, "dev", name]).await {
        delete_tap(name).await;
        return Err(e.into());
    }
    if let Err(e) = command::run("ip", &["link", "set", name, "up"]).await {
        delete_tap(name).await;
        return Err(e.into());
    }
    Ok(())
}

async fn delete_tap(name: &str) {
    debug!(%name, "deleting TAP device");
    command::run_ignore_errors("ip", &["link", "del", name]).await;
}

/// The /30 currently assigned to a specific TAP, if the link exists.
async fn subnet_of_tap(name: &str) -> Option<String> {
    let out = command::run("ip", &["-o", "addr", "show", "dev", name])
        .await
        .ok()?;
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        for pair in fields.windows(2) {
            if pair[0] == "inet" {
                if let Some(cidr) = allocator::network_of(pair[1]) {
                    return Some(cidr);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_truncates_long_ids() {
        assert_eq!(
            tap_name("3bf20a12deadbeefcafe0123456789ab"),
            "df-3bf20a12"
        );
    }

    #[test]
    fn tap_name_keeps_short_ids() {
        assert_eq!(tap_name("c1"), "df-c1");
    }

    #[test]
    fn tap_name_is_pure_in_the_id() {
        assert_eq!(tap_name("abcdef12345"), tap_name("abcdef12999"));
        assert_ne!(tap_name("abcdef12"), tap_name("abcdef13"));
    }

    #[tokio::test]
    async fn teardown_without_tap_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ctr = Container::new("c1", "/b".into(), dir.path().to_path_buf());
        // No tap_device recorded; must return without touching the host.
        teardown(&ctr).await;
    }
}
