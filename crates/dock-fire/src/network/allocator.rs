//! Point-to-point /30 allocation from the `10.0.0.0/16` pool.
//!
//! A subnet is considered used if any on-disk container record claims it OR
//! a live `df-*` TAP device carries an address inside it. Crashed containers
//! leave a TAP but no record, so the state scan alone would hand the same
//! subnet out twice; the link scan is the crash-recovery anchor.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::debug;

use super::error::{NetworkError, Result};
use super::TAP_PREFIX;
use crate::command;
use crate::container;

/// Pool the /30s are carved from. 2^14 = 16,384 candidate subnets.
const POOL: &str = "10.0.0.0/16";
const POOL_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
const POOL_SUBNETS: u32 = 16_384;

/// One allocated /30: network, host side, guest side, broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    /// First usable address, assigned to the TAP device.
    pub host_ip: Ipv4Addr,
    /// Second usable address, assigned to the guest's eth0 via boot args.
    pub guest_ip: Ipv4Addr,
    /// The /30 in `X.X.X.X/30` form.
    pub cidr: String,
}

/// Find the lowest free /30 in the pool.
pub async fn allocate(root_dir: &Path) -> Result<Subnet> {
    let mut used = HashSet::new();

    let ids = container::list(root_dir).map_err(|e| NetworkError::Store(e.to_string()))?;
    for id in ids {
        // Records that fail to load are skipped; their subnet, if any, is
        // still covered by the live-TAP scan below.
        let Ok(ctr) = container::load(root_dir, &id) else {
            continue;
        };
        if !ctr.subnet_cidr.is_empty() {
            used.insert(ctr.subnet_cidr);
        }
    }

    for cidr in used_tap_subnets().await {
        used.insert(cidr);
    }

    let subnet = allocate_from(&used).ok_or(NetworkError::NoSubnet { pool: POOL })?;
    debug!(
        cidr = %subnet.cidr,
        host = %subnet.host_ip,
        guest = %subnet.guest_ip,
        "allocated subnet"
    );
    Ok(subnet)
}

/// Enumerate candidates at offset 4·i from the pool base, ascending, and
/// return the first not in `used`.
fn allocate_from(used: &HashSet<String>) -> Option<Subnet> {
    let base = u32::from(POOL_BASE);
    for i in 0..POOL_SUBNETS {
        let network = base + i * 4;
        let cidr = format!("{}/30", Ipv4Addr::from(network));
        if used.contains(&cidr) {
            continue;
        }
        return Some(Subnet {
            host_ip: Ipv4Addr::from(network + 1),
            guest_ip: Ipv4Addr::from(network + 2),
            cidr,
        });
    }
    None
}

/// The /30 networks currently attached to `df-*` links on the host.
async fn used_tap_subnets() -> Vec<String> {
    // One line per address:
    // "131: df-3bf20a12    inet 10.0.0.1/30 scope global df-3bf20a12\ ..."
    match command::run("ip", &["-o", "addr", "show"]).await {
        Ok(out) => parse_tap_subnets(&out),
        Err(e) => {
            debug!("ip addr scan failed: {e}");
            Vec::new()
        }
    }
}

fn parse_tap_subnets(output: &str) -> Vec<String> {
    let mut cidrs = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if !fields[1].starts_with(TAP_PREFIX) {
            continue;
        }
        for pair in fields.windows(2) {
            if pair[0] != "inet" {
                continue;
            }
            if let Some(cidr) = network_of(pair[1]) {
                cidrs.push(cidr);
            }
        }
    }
    cidrs
}

/// Reduce an interface address like `10.0.0.1/30` to its network,
/// `10.0.0.0/30`.
pub(super) fn network_of(addr: &str) -> Option<String> {
    let (ip, prefix) = addr.split_once('/')?;
    let ip: Ipv4Addr = ip.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    Some(format!("{network}/{prefix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_is_pool_base() {
        let s = allocate_from(&HashSet::new()).unwrap();
        assert_eq!(s.cidr, "10.0.0.0/30");
        assert_eq!(s.host_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(s.guest_ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn used_subnets_are_skipped() {
        let used: HashSet<String> = ["10.0.0.0/30", "10.0.0.4/30"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let s = allocate_from(&used).unwrap();
        assert_eq!(s.cidr, "10.0.0.8/30");
        assert_eq!(s.host_ip, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(s.guest_ip, Ipv4Addr::new(10, 0, 0, 10));
    }

    #[test]
    fn allocation_crosses_the_third_octet() {
        let used: HashSet<String> = (0..64).map(|i| format!("10.0.0.{}/30", i * 4)).collect();
        let s = allocate_from(&used).unwrap();
        assert_eq!(s.cidr, "10.0.1.0/30");
    }

    #[test]
    fn host_and_guest_are_offsets_one_and_two() {
        // Invariant check across a sample of the pool.
        for i in [0u32, 1, 63, 64, 1000, POOL_SUBNETS - 1] {
            let used: HashSet<String> = (0..i)
                .map(|j| {
                    let net = u32::from(POOL_BASE) + j * 4;
                    format!("{}/30", Ipv4Addr::from(net))
                })
                .collect();
            let s = allocate_from(&used).unwrap();
            let network = u32::from(POOL_BASE) + i * 4;
            assert_eq!(u32::from(s.host_ip), network + 1);
            assert_eq!(u32::from(s.guest_ip), network + 2);
            assert!(s.cidr.ends_with("/30"));
        }
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let used: HashSet<String> = (0..POOL_SUBNETS)
            .map(|i| {
                let net = u32::from(POOL_BASE) + i * 4;
                format!("{}/30", Ipv4Addr::from(net))
            })
            .collect();
        assert!(allocate_from(&used).is_none());
    }

    #[test]
    fn sequential_allocations_are_disjoint() {
        let mut used = HashSet::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let s = allocate_from(&used).unwrap();
            assert!(seen.insert(s.cidr.clone()), "duplicate {}", s.cidr);
            used.insert(s.cidr);
        }
    }

    #[test]
    fn parse_tap_subnets_extracts_df_links_only() {
        let out = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever
2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0\\       valid_lft forever
131: df-3bf20a12    inet 10.0.0.1/30 scope global df-3bf20a12\\       valid_lft forever
132: df-9ac41b00    inet 10.0.0.5/30 scope global df-9ac41b00\\       valid_lft forever";
        let cidrs = parse_tap_subnets(out);
        assert_eq!(cidrs, vec!["10.0.0.0/30", "10.0.0.4/30"]);
    }

    #[test]
    fn parse_tap_subnets_ignores_inet6() {
        let out = "131: df-3bf20a12    inet6 fe80::1/64 scope link\\       valid_lft forever";
        assert!(parse_tap_subnets(out).is_empty());
    }

    #[test]
    fn stale_tap_masks_its_subnet() {
        // A crashed container's TAP holds 10.0.0.0/30; next allocation skips it.
        let out = "7: df-dead0001    inet 10.0.0.1/30 scope global df-dead0001\\       x";
        let used: HashSet<String> = parse_tap_subnets(out).into_iter().collect();
        let s = allocate_from(&used).unwrap();
        assert_eq!(s.cidr, "10.0.0.4/30");
    }

    #[test]
    fn network_of_masks_host_bits() {
        assert_eq!(network_of("10.0.0.1/30").unwrap(), "10.0.0.0/30");
        assert_eq!(network_of("10.0.3.6/30").unwrap(), "10.0.3.4/30");
        assert_eq!(network_of("192.168.1.10/24").unwrap(), "192.168.1.0/24");
        assert!(network_of("not-an-ip/30").is_none());
        assert!(network_of("10.0.0.1").is_none());
        assert!(network_of("10.0.0.1/33").is_none());
    }
}
