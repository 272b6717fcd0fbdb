//! Root-filesystem image builder: the supervisor's rootfs tree becomes a
//! sparse ext4 block image with the guest init and its config overlaid.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;
use serde::Serialize;
use tracing::{debug, warn};

use crate::command;
use crate::error::{Result, RuntimeError};
use crate::oci;

/// Floor for the image size. Sparse allocation means unused capacity costs
/// no host bytes, so the default is generous.
const DEFAULT_MIN_SIZE: u64 = 1024 * 1024 * 1024;

const DISK_SIZE_ANNOTATION: &str = "dock-fire/disk-size";
const DISK_SIZE_ENV: &str = "DOCK_FIRE_DISK_SIZE";

/// Configuration handed to the guest init at `/etc/dock-fire/config.json`.
#[derive(Debug, Serialize)]
struct InitConfig {
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    terminal: bool,
}

impl InitConfig {
    fn from_spec(spec: &Spec) -> Self {
        let mut cfg = Self {
            args: Vec::new(),
            env: Vec::new(),
            cwd: "/".to_string(),
            terminal: false,
        };
        if let Some(process) = spec.process().as_ref() {
            if let Some(args) = process.args().as_ref() {
                cfg.args = args.clone();
            }
            if let Some(env) = process.env().as_ref() {
                cfg.env = env.clone();
            }
            cfg.terminal = process.terminal().unwrap_or(false);
            let cwd = process.cwd();
            if !cwd.as_os_str().is_empty() {
                cfg.cwd = cwd.display().to_string();
            }
        }
        cfg
    }
}

/// Build `{root}/{id}/rootfs.ext4` from the bundle's rootfs directory.
///
/// The mount point is unmounted and removed on every exit path.
pub async fn create(root_dir: &Path, id: &str, rootfs: &Path, spec: &Spec) -> Result<PathBuf> {
    let state_dir = root_dir.join(id);
    tokio::fs::create_dir_all(&state_dir)
        .await
        .map_err(|e| RuntimeError::io(format!("mkdir {}", state_dir.display()), e))?;

    let image_path = state_dir.join("rootfs.ext4");
    let mount_point = state_dir.join("mnt");

    let rootfs_bytes = dir_size(rootfs).await?;
    let size = image_size(rootfs_bytes, min_size(spec));
    debug!(rootfs_bytes, size, "sizing rootfs image");

    // A set_len past EOF yields a sparse file; no bytes are allocated until
    // the filesystem writes them.
    let file = std::fs::File::create(&image_path)
        .map_err(|e| RuntimeError::io(format!("create {}", image_path.display()), e))?;
    file.set_len(size)
        .map_err(|e| RuntimeError::io(format!("truncate {}", image_path.display()), e))?;
    drop(file);

    let image = image_path.display().to_string();
    command::run("mkfs.ext4", &["-q", "-F", &image]).await?;

    tokio::fs::create_dir_all(&mount_point)
        .await
        .map_err(|e| RuntimeError::io(format!("mkdir {}", mount_point.display()), e))?;
    let mnt = mount_point.display().to_string();
    if let Err(e) = command::run("mount", &["-o", "loop", &image, &mnt]).await {
        let _ = tokio::fs::remove_dir(&mount_point).await;
        return Err(e.into());
    }

    let result = populate(&mount_point, rootfs, spec).await;

    let umounted = if result.is_ok() {
        command::run("umount", &[mnt.as_str()]).await.map(|_| ())
    } else {
        command::run_ignore_errors("umount", &[mnt.as_str()]).await;
        Ok(())
    };
    let _ = tokio::fs::remove_dir(&mount_point).await;
    result?;
    umounted?;

    debug!(image = %image_path.display(), "created rootfs image");
    Ok(image_path)
}

/// Copy the rootfs tree and overlay the init binary and init config.
async fn populate(mount_point: &Path, rootfs: &Path, spec: &Spec) -> Result<()> {
    // cp -a preserves ownership, permissions, and symlinks; the trailing
    // `/.` copies the tree's contents rather than the directory itself.
    let src = format!("{}/.", rootfs.display());
    let dst = format!("{}/", mount_point.display());
    command::run("cp", &["-a", &src, &dst]).await?;

    let init_src = find_init_binary()?;
    let sbin = mount_point.join("sbin");
    tokio::fs::create_dir_all(&sbin)
        .await
        .map_err(|e| RuntimeError::io(format!("mkdir {}", sbin.display()), e))?;
    let init_dst = sbin.join("dock-fire-init");
    tokio::fs::copy(&init_src, &init_dst)
        .await
        .map_err(|e| RuntimeError::io(format!("install {}", init_dst.display()), e))?;
    set_mode(&init_dst, 0o755)?;

    let cfg_dir = mount_point.join("etc/dock-fire");
    tokio::fs::create_dir_all(&cfg_dir)
        .await
        .map_err(|e| RuntimeError::io(format!("mkdir {}", cfg_dir.display()), e))?;
    let cfg = InitConfig::from_spec(spec);
    let data = serde_json::to_vec_pretty(&cfg)
        .map_err(|e| RuntimeError::Internal(format!("marshal init config: {e}")))?;
    let cfg_path = cfg_dir.join("config.json");
    tokio::fs::write(&cfg_path, data)
        .await
        .map_err(|e| RuntimeError::io(format!("write {}", cfg_path.display()), e))?;
    set_mode(&cfg_path, 0o644)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| RuntimeError::io(format!("chmod {}", path.display()), e))
}

/// `max(min, rootfs + 20%)`; the padding covers ext4 metadata and small
/// guest writes.
fn image_size(rootfs_bytes: u64, min: u64) -> u64 {
    (rootfs_bytes + rootfs_bytes / 5).max(min)
}

/// Minimum image size: annotation > environment > 1 GiB. Invalid values are
/// logged and ignored.
fn min_size(spec: &Spec) -> u64 {
    min_size_from(
        oci::annotation(spec, DISK_SIZE_ANNOTATION),
        std::env::var(DISK_SIZE_ENV).ok().as_deref(),
    )
}

fn min_size_from(annotation: Option<&str>, env: Option<&str>) -> u64 {
    if let Some(v) = annotation {
        match parse_size(v) {
            Ok(n) => return n,
            Err(e) => warn!("ignoring invalid {DISK_SIZE_ANNOTATION} annotation {v:?}: {e}"),
        }
    }
    if let Some(v) = env {
        match parse_size(v) {
            Ok(n) => return n,
            Err(e) => warn!("ignoring invalid {DISK_SIZE_ENV}={v:?}: {e}"),
        }
    }
    DEFAULT_MIN_SIZE
}

/// Parse a size string: `{n}G` (GiB), `{n}M` (MiB), or plain bytes.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        b'M' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {s:?}"))?;
    if n == 0 {
        return Err(format!("invalid size {s:?}"));
    }
    n.checked_mul(multiplier)
        .ok_or_else(|| format!("size {s:?} overflows"))
}

/// Total byte size of the regular files under a directory.
async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| RuntimeError::io(format!("read {}", current.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RuntimeError::io(format!("read {}", current.display()), e))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// The guest init binary ships next to the runtime or in a system bin dir.
fn find_init_binary() -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("dock-fire-init"));
        }
    }
    candidates.push(PathBuf::from("/usr/local/bin/dock-fire-init"));
    candidates.push(PathBuf::from("/usr/bin/dock-fire-init"));

    first_existing(&candidates).ok_or_else(|| {
        RuntimeError::Internal(format!(
            "dock-fire-init not found in any of: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.exists()).cloned()
}
