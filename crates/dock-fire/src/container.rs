//! Persistent per-container state and the lifecycle state machine.
//!
//! One record per container id, stored as `{root}/{id}/state.json` (0600 in a
//! 0700 directory). Everything else the runtime produces for a container
//! (rootfs image, VM logs) lives in the same directory and is removed with it.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persistent state for a single container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub bundle: PathBuf,
    pub status: Status,
    /// VMM process pid, 0 until captured.
    #[serde(default, skip_serializing_if = "pid_is_zero")]
    pub pid: i32,
    pub root_dir: PathBuf,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub socket_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tap_device: String,
    #[serde(rename = "guestIP", default, skip_serializing_if = "String::is_empty")]
    pub guest_ip: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    #[serde(rename = "subnetCIDR", default, skip_serializing_if = "String::is_empty")]
    pub subnet_cidr: String,
}

fn pid_is_zero(pid: &i32) -> bool {
    *pid == 0
}

impl Container {
    pub fn new(id: impl Into<String>, bundle: PathBuf, root_dir: PathBuf) -> Self {
        Self {
            id: id.into(),
            bundle,
            status: Status::Creating,
            pid: 0,
            root_dir,
            image_path: String::new(),
            socket_path: String::new(),
            tap_device: String::new(),
            guest_ip: String::new(),
            host_ip: String::new(),
            subnet_cidr: String::new(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root_dir.join(&self.id)
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    /// Persist the record, replacing `state.json` as a whole.
    ///
    /// Writes to a temporary file in the state directory and renames it over
    /// the old one, so a concurrent reader sees the old or the new content,
    /// never a prefix.
    pub fn save(&self) -> Result<()> {
        let dir = self.state_dir();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| RuntimeError::io(format!("mkdir {}", dir.display()), e))?;

        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| RuntimeError::Internal(format!("marshal state: {e}")))?;

        let tmp = dir.join("state.json.tmp");
        {
            use std::io::Write;
            let mut f = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(|e| RuntimeError::io(format!("open {}", tmp.display()), e))?;
            f.write_all(&data)
                .map_err(|e| RuntimeError::io(format!("write {}", tmp.display()), e))?;
        }
        fs::rename(&tmp, self.state_path())
            .map_err(|e| RuntimeError::io(format!("rename {}", tmp.display()), e))
    }

    /// Move to a new status, enforcing
    /// `creating -> created -> running -> stopped`.
    pub fn transition(&mut self, to: Status) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (Status::Creating, Status::Created)
                | (Status::Created, Status::Running)
                | (Status::Running, Status::Stopped)
        );
        if !allowed {
            return Err(RuntimeError::Internal(format!(
                "invalid transition: {} -> {to}",
                self.status
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Probe the VMM process with signal 0. Any error counts as dead.
    pub fn is_vmm_alive(&self) -> bool {
        if self.pid <= 0 {
            return false;
        }
        kill(Pid::from_raw(self.pid), None).is_ok()
    }

    /// The status to report: a `running` record whose VMM is gone is
    /// effectively `stopped`.
    pub fn effective_status(&self) -> Status {
        if self.status == Status::Running && !self.is_vmm_alive() {
            return Status::Stopped;
        }
        self.status
    }
}

/// Read a container record from the state directory.
pub fn load(root_dir: &Path, id: &str) -> Result<Container> {
    let state_path = root_dir.join(id).join("state.json");
    let data = match fs::read(&state_path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Err(e) => {
            return Err(RuntimeError::CorruptState {
                id: id.to_string(),
                detail: e.to_string(),
            });
        }
    };
    serde_json::from_slice(&data).map_err(|e| RuntimeError::CorruptState {
        id: id.to_string(),
        detail: e.to_string(),
    })
}

/// Remove the container's state directory and everything in it.
pub fn delete(root_dir: &Path, id: &str) -> Result<()> {
    let dir = root_dir.join(id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RuntimeError::io(format!("remove {}", dir.display()), e)),
    }
}

/// Whether a record for `id` already exists on disk.
pub fn exists(root_dir: &Path, id: &str) -> bool {
    root_dir.join(id).join("state.json").exists()
}

/// All container ids present under the state root.
pub fn list(root_dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(root_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RuntimeError::io(format!("read {}", root_dir.display()), e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RuntimeError::io(format!("read {}", root_dir.display()), e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
    }
    Ok(ids)
}
