use std::path::{Path, PathBuf};

use clap::Args;
use oci_spec::runtime::Spec;
use tracing::{debug, info};

use crate::container::{self, Container, Status};
use crate::error::{Result, RuntimeError};
use crate::{image, network, oci, vmm};

#[derive(Args)]
pub struct CreateArgs {
    /// Path to the root of the OCI bundle
    #[arg(long, default_value = ".")]
    bundle: PathBuf,

    /// Path to an AF_UNIX socket for terminal I/O
    #[arg(long)]
    console_socket: Option<PathBuf>,

    /// File to write the VMM process id to
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Accepted for OCI compatibility; a microVM never pivots
    #[arg(long, hide = true)]
    no_pivot: bool,

    /// Your name for the instance of the container
    container_id: String,
}

/// `create` does all the heavy lifting: image, network, VMM boot. The VM
/// must be running before this verb returns because the supervisor expects
/// the pid-file to name a live process; `start` is then only a state flip.
pub async fn run_create(root: &Path, args: CreateArgs) -> Result<()> {
    let id = &args.container_id;
    let bundle = absolutize(&args.bundle)?;
    debug!(%id, bundle = %bundle.display(), root = %root.display(), "create");

    if container::exists(root, id) {
        return Err(RuntimeError::AlreadyExists(id.clone()));
    }

    let spec = oci::load_spec(&bundle)?;
    preflight()?;

    // Claim the id before any resource work starts; a concurrent create of
    // the same id fails the exists() check above or loses the save race.
    let mut ctr = Container::new(id.clone(), bundle, root.to_path_buf());
    ctr.save()?;

    if let Err(e) = build_and_boot(&mut ctr, &spec, args.console_socket.as_deref()).await {
        rollback(&ctr).await;
        return Err(e);
    }

    ctr.transition(Status::Created)?;
    ctr.save()?;

    if let Some(pid_file) = &args.pid_file {
        std::fs::write(pid_file, ctr.pid.to_string())
            .map_err(|e| RuntimeError::io(format!("write pid file {}", pid_file.display()), e))?;
    }

    info!(%id, pid = ctr.pid, "container created");
    Ok(())
}

async fn build_and_boot(
    ctr: &mut Container,
    spec: &Spec,
    console_socket: Option<&Path>,
) -> Result<()> {
    let rootfs = oci::rootfs_path(&ctr.bundle, spec);
    let image_path = image::create(&ctr.root_dir, &ctr.id, &rootfs, spec).await?;
    ctr.image_path = image_path.display().to_string();

    network::setup(ctr).await?;
    vmm::start(ctr, spec, console_socket).await?;
    Ok(())
}

/// Undo whatever this invocation acquired. The state directory removal also
/// takes the image and the VM logs with it.
async fn rollback(ctr: &Container) {
    vmm::stop(ctr).await;
    network::teardown(ctr).await;
    if !ctr.socket_path.is_empty() {
        let _ = std::fs::remove_file(&ctr.socket_path);
    }
    let _ = container::delete(&ctr.root_dir, &ctr.id);
}

/// Fail early, naming the missing tool, rather than mid-build with a spawn
/// error.
fn preflight() -> Result<()> {
    const TOOLS: &[&str] = &[
        "ip",
        "iptables",
        "sysctl",
        "mkfs.ext4",
        "mount",
        "umount",
        "cp",
        vmm::FIRECRACKER_BIN,
    ];
    for tool in TOOLS {
        which::which(tool).map_err(|_| RuntimeError::MissingTool(tool.to_string()))?;
    }
    Ok(())
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| RuntimeError::io("getcwd", e))?;
    Ok(cwd.join(path))
}
