use std::path::Path;

use clap::Args;
use tracing::{debug, info, warn};

use crate::container;
use crate::error::{Result, RuntimeError};
use crate::{network, vmm};

#[derive(Args)]
pub struct DeleteArgs {
    /// Delete even if the VM is running or the state file is unreadable
    #[arg(long)]
    force: bool,

    /// Your name for the instance of the container
    container_id: String,
}

/// Remove the container: VMM (if forced), network, control socket, state
/// directory. Teardown steps are best-effort; `delete` always tries to
/// finish.
pub async fn run_delete(root: &Path, args: DeleteArgs) -> Result<()> {
    let id = &args.container_id;
    debug!(%id, force = args.force, "delete");

    let ctr = match container::load(root, id) {
        Ok(ctr) => ctr,
        Err(e @ RuntimeError::NotFound(_)) => return Err(e),
        Err(e) => {
            if !args.force {
                return Err(e);
            }
            // The record is unreadable; clean up whatever the id alone can
            // name: the TAP (and its NAT tuple, recovered from the live
            // link), the control socket, the state directory.
            warn!(%id, "state file unreadable, forcing best-effort teardown: {e}");
            network::teardown_by_id(id).await;
            let _ = std::fs::remove_file(vmm::config::socket_path(id));
            container::delete(root, id)?;
            return Ok(());
        }
    };

    if ctr.is_vmm_alive() {
        if !args.force {
            return Err(RuntimeError::Internal(format!(
                "container {id:?} has a running VM, use --force to delete"
            )));
        }
        vmm::stop(&ctr).await;
    }

    network::teardown(&ctr).await;

    if !ctr.socket_path.is_empty() {
        let _ = std::fs::remove_file(&ctr.socket_path);
    }

    container::delete(root, id)?;
    info!(%id, "container deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, Status};

    #[tokio::test]
    async fn delete_removes_the_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctr = Container::new("c1", "/b".into(), dir.path().to_path_buf());
        ctr.status = Status::Created;
        ctr.save().unwrap();
        std::fs::write(dir.path().join("c1/rootfs.ext4"), b"img").unwrap();

        run_delete(
            dir.path(),
            DeleteArgs {
                force: false,
                container_id: "c1".into(),
            },
        )
        .await
        .unwrap();

        assert!(!dir.path().join("c1").exists());
    }

    #[tokio::test]
    async fn second_delete_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctr = Container::new("c1", "/b".into(), dir.path().to_path_buf());
        ctr.status = Status::Created;
        ctr.save().unwrap();

        let del = || DeleteArgs {
            force: false,
            container_id: "c1".into(),
        };
        run_delete(dir.path(), del()).await.unwrap();
        let err = run_delete(dir.path(), del()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn delete_refuses_a_live_vm_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let mut ctr = Container::new("c1", "/b".into(), dir.path().to_path_buf());
        ctr.status = Status::Created;
        ctr.pid = child.id() as i32;
        ctr.save().unwrap();

        let err = run_delete(
            dir.path(),
            DeleteArgs {
                force: false,
                container_id: "c1".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--force"), "got: {err}");
        assert!(dir.path().join("c1").exists());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn forced_delete_stops_the_vm_first() {
        let dir = tempfile::tempdir().unwrap();
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let mut ctr = Container::new("c1", "/b".into(), dir.path().to_path_buf());
        ctr.status = Status::Created;
        ctr.pid = child.id() as i32;
        ctr.save().unwrap();

        run_delete(
            dir.path(),
            DeleteArgs {
                force: true,
                container_id: "c1".into(),
            },
        )
        .await
        .unwrap();

        assert!(!dir.path().join("c1").exists());
        let mut child = child;
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn corrupt_state_is_fatal_without_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bad")).unwrap();
        std::fs::write(dir.path().join("bad/state.json"), b"][").unwrap();

        let err = run_delete(
            dir.path(),
            DeleteArgs {
                force: false,
                container_id: "bad".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::CorruptState { .. }));
        assert!(dir.path().join("bad").exists());
    }

    #[tokio::test]
    async fn forced_delete_survives_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bad")).unwrap();
        std::fs::write(dir.path().join("bad/state.json"), b"][").unwrap();

        run_delete(
            dir.path(),
            DeleteArgs {
                force: true,
                container_id: "bad".into(),
            },
        )
        .await
        .unwrap();
        assert!(!dir.path().join("bad").exists());
    }
}
