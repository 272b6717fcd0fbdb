//! Firecracker VM configuration: boot arguments, machine sizing, and the
//! config file handed to the VMM on its command line.

use oci_spec::runtime::Spec;
use serde::Serialize;
use tracing::warn;

use crate::container::Container;
use crate::oci;

pub const DEFAULT_KERNEL_PATH: &str = "/var/lib/vmm/images/kernels/vmlinux.bin";
const DEFAULT_VCPUS: u32 = 1;
const DEFAULT_MEM_MIB: u64 = 128;

const VCPUS_ANNOTATION: &str = "dock-fire/vcpus";
const VCPUS_ENV: &str = "DOCK_FIRE_VCPUS";
const MEMORY_ANNOTATION: &str = "dock-fire/memory";
const MEMORY_ENV: &str = "DOCK_FIRE_MEMORY";
const KERNEL_ENV: &str = "DOCK_FIRE_KERNEL_PATH";

/// Control socket path. The id is truncated to 12 characters so the path
/// stays under the 108-byte sockaddr_un limit no matter how deep the state
/// root is: supervisors combine long roots with 64-character ids.
pub fn socket_path(id: &str) -> String {
    let short: String = id.chars().take(12).collect();
    format!("/tmp/fc-{short}.sock")
}

/// Deterministic locally-administered unicast MAC: `02:` plus the first five
/// bytes of the id, zero-padded.
pub fn generate_mac(id: &str) -> String {
    let mut bytes = [0u8; 5];
    for (i, b) in id.bytes().take(5).enumerate() {
        bytes[i] = b;
    }
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// Kernel boot arguments.
///
/// `loglevel=0` is load-bearing: `quiet` alone still leaks late boot
/// messages onto the serial console, which is the container's stdout.
pub fn boot_args(ctr: &Container) -> String {
    let mut args = String::from(
        "console=ttyS0 reboot=k panic=1 pci=off loglevel=0 \
         i8042.noaux i8042.nomux i8042.nopnp i8042.dumbkbd \
         init=/sbin/dock-fire-init",
    );
    if !ctr.guest_ip.is_empty() && !ctr.host_ip.is_empty() {
        // ip=<client>::<gateway>:<netmask>::<device>:off
        args.push_str(&format!(
            " ip={}::{}:255.255.255.252::eth0:off",
            ctr.guest_ip, ctr.host_ip
        ));
    }
    args
}

/// Guest kernel path: `DOCK_FIRE_KERNEL_PATH` over the compiled-in default.
pub fn kernel_path() -> String {
    match std::env::var(KERNEL_ENV) {
        Ok(p) if !p.is_empty() => p,
        _ => DEFAULT_KERNEL_PATH.to_string(),
    }
}

pub fn vcpu_count(spec: &Spec) -> u32 {
    vcpus_from(
        oci::annotation(spec, VCPUS_ANNOTATION),
        std::env::var(VCPUS_ENV).ok().as_deref(),
    )
}

fn vcpus_from(annotation: Option<&str>, env: Option<&str>) -> u32 {
    if let Some(v) = annotation {
        match parse_vcpus(v) {
            Some(n) => return n,
            None => warn!("ignoring invalid {VCPUS_ANNOTATION} annotation {v:?}"),
        }
    }
    if let Some(v) = env {
        match parse_vcpus(v) {
            Some(n) => return n,
            None => warn!("ignoring invalid {VCPUS_ENV}={v:?}"),
        }
    }
    DEFAULT_VCPUS
}

fn parse_vcpus(s: &str) -> Option<u32> {
    s.trim().parse().ok().filter(|n| *n > 0)
}

pub fn mem_size_mib(spec: &Spec) -> u64 {
    mem_from(
        oci::annotation(spec, MEMORY_ANNOTATION),
        std::env::var(MEMORY_ENV).ok().as_deref(),
    )
}

fn mem_from(annotation: Option<&str>, env: Option<&str>) -> u64 {
    if let Some(v) = annotation {
        match parse_mem_mib(v) {
            Some(n) => return n,
            None => warn!("ignoring invalid {MEMORY_ANNOTATION} annotation {v:?}"),
        }
    }
    if let Some(v) = env {
        match parse_mem_mib(v) {
            Some(n) => return n,
            None => warn!("ignoring invalid {MEMORY_ENV}={v:?}"),
        }
    }
    DEFAULT_MEM_MIB
}

/// Parse a memory size into MiB: `{n}G`, `{n}M`, or plain MiB.
fn parse_mem_mib(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'G' => (&s[..s.len() - 1], 1024),
        b'M' => (&s[..s.len() - 1], 1),
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(multiplier))
}

/// The VM definition Firecracker reads via `--config-file`.
#[derive(Debug, Serialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,
    drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    machine_config: MachineConfig,
    #[serde(rename = "network-interfaces", skip_serializing_if = "Vec::is_empty")]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u64,
    smt: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

/// Assemble the full VM config for a container.
pub fn build(ctr: &Container, spec: &Spec) -> VmConfig {
    let mut network_interfaces = Vec::new();
    if !ctr.tap_device.is_empty() {
        network_interfaces.push(NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: generate_mac(&ctr.id),
            host_dev_name: ctr.tap_device.clone(),
        });
    }
    VmConfig {
        boot_source: BootSource {
            kernel_image_path: kernel_path(),
            boot_args: boot_args(ctr),
        },
        drives: vec![Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: ctr.image_path.clone(),
            is_root_device: true,
            is_read_only: false,
        }],
        machine_config: MachineConfig {
            vcpu_count: vcpu_count(spec),
            mem_size_mib: mem_size_mib(spec),
            smt: false,
        },
        network_interfaces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn container(root: &std::path::Path) -> Container {
        Container::new(
            "3bf20a12deadbeefcafe0123456789abcdef0123456789abcdef0123456789ab",
            PathBuf::from("/b"),
            root.to_path_buf(),
        )
    }

    #[test]
    fn socket_path_is_bounded_for_any_id() {
        // sockaddr_un caps paths at 108 bytes.
        let long_id = "x".repeat(512);
        let path = socket_path(&long_id);
        assert!(path.len() <= 108, "{} bytes", path.len());
        assert_eq!(path, format!("/tmp/fc-{}.sock", "x".repeat(12)));

        assert_eq!(socket_path("ab"), "/tmp/fc-ab.sock");
    }

    #[test]
    fn mac_is_deterministic_and_locally_administered() {
        let a = generate_mac("abcdef123456");
        let b = generate_mac("abcdef123456");
        assert_eq!(a, b);
        assert!(a.starts_with("02:"));
        // 'a' = 0x61, 'b' = 0x62 ...
        assert_eq!(a, "02:61:62:63:64:65");
    }

    #[test]
    fn mac_pads_short_ids_with_zeros() {
        assert_eq!(generate_mac("ab"), "02:61:62:00:00:00");
        assert_eq!(generate_mac(""), "02:00:00:00:00:00");
    }

    #[test]
    fn boot_args_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let ctr = container(dir.path());
        let args = boot_args(&ctr);
        assert_eq!(
            args,
            "console=ttyS0 reboot=k panic=1 pci=off loglevel=0 \
             i8042.noaux i8042.nomux i8042.nopnp i8042.dumbkbd \
             init=/sbin/dock-fire-init"
        );
        assert!(!args.contains("ip="));
    }

    #[test]
    fn boot_args_with_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctr = container(dir.path());
        ctr.host_ip = "10.0.0.1".into();
        ctr.guest_ip = "10.0.0.2".into();
        let args = boot_args(&ctr);
        assert!(
            args.ends_with(" ip=10.0.0.2::10.0.0.1:255.255.255.252::eth0:off"),
            "got: {args}"
        );
    }

    #[test]
    fn parse_mem_mib_units() {
        assert_eq!(parse_mem_mib("256"), Some(256));
        assert_eq!(parse_mem_mib("256M"), Some(256));
        assert_eq!(parse_mem_mib("1G"), Some(1024));
        assert_eq!(parse_mem_mib("2g"), Some(2048));
        assert_eq!(parse_mem_mib(""), None);
        assert_eq!(parse_mem_mib("lots"), None);
        assert_eq!(parse_mem_mib("0"), None);
        assert_eq!(parse_mem_mib("-1"), None);
    }

    #[test]
    fn vcpus_annotation_beats_env_beats_default() {
        assert_eq!(vcpus_from(Some("4"), Some("2")), 4);
        assert_eq!(vcpus_from(None, Some("2")), 2);
        assert_eq!(vcpus_from(None, None), DEFAULT_VCPUS);
    }

    #[test]
    fn invalid_vcpus_fall_through_not_fatal() {
        assert_eq!(vcpus_from(Some("zero"), Some("2")), 2);
        assert_eq!(vcpus_from(Some("0"), None), DEFAULT_VCPUS);
        assert_eq!(vcpus_from(Some("-3"), None), DEFAULT_VCPUS);
    }

    #[test]
    fn mem_annotation_beats_env_beats_default() {
        assert_eq!(mem_from(Some("256M"), Some("1G")), 256);
        assert_eq!(mem_from(None, Some("1G")), 1024);
        assert_eq!(mem_from(None, None), DEFAULT_MEM_MIB);
        assert_eq!(mem_from(Some("junk"), None), DEFAULT_MEM_MIB);
    }

    #[test]
    fn vm_config_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctr = container(dir.path());
        ctr.image_path = "/run/dock-fire/c/rootfs.ext4".into();
        ctr.tap_device = "df-3bf20a12".into();
        ctr.host_ip = "10.0.0.1".into();
        ctr.guest_ip = "10.0.0.2".into();

        let spec: Spec = serde_json::from_value(serde_json::json!({
            "ociVersion": "1.0.2",
            "process": {
                "args": ["true"],
                "cwd": "/",
                "user": { "uid": 0, "gid": 0 }
            },
            "root": { "path": "rootfs" },
            "annotations": { "dock-fire/vcpus": "2", "dock-fire/memory": "256M" }
        }))
        .unwrap();

        let cfg = build(&ctr, &spec);
        let v: serde_json::Value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["machine-config"]["vcpu_count"], 2);
        assert_eq!(v["machine-config"]["mem_size_mib"], 256);
        assert_eq!(v["machine-config"]["smt"], false);
        assert_eq!(v["drives"][0]["drive_id"], "rootfs");
        assert_eq!(v["drives"][0]["path_on_host"], "/run/dock-fire/c/rootfs.ext4");
        assert_eq!(v["drives"][0]["is_root_device"], true);
        assert_eq!(v["network-interfaces"][0]["iface_id"], "eth0");
        assert_eq!(v["network-interfaces"][0]["host_dev_name"], "df-3bf20a12");
        assert!(v["boot-source"]["boot_args"]
            .as_str()
            .unwrap()
            .contains("init=/sbin/dock-fire-init"));
    }

    #[test]
    fn vm_config_omits_network_without_a_tap() {
        let dir = tempfile::tempdir().unwrap();
        let ctr = container(dir.path());
        let spec: Spec = serde_json::from_value(serde_json::json!({
            "ociVersion": "1.0.2",
            "process": {
                "args": ["true"],
                "cwd": "/",
                "user": { "uid": 0, "gid": 0 }
            },
            "root": { "path": "rootfs" }
        }))
        .unwrap();
        let v: serde_json::Value = serde_json::to_value(build(&ctr, &spec)).unwrap();
        assert!(v.get("network-interfaces").is_none());
    }
}
