//! OCI bundle input and OCI state output.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;
use serde::Serialize;

use crate::container::{Container, Status};
use crate::error::{Result, RuntimeError};

pub const OCI_VERSION: &str = "1.0.2";

/// Load and validate `config.json` from a bundle directory.
///
/// The runtime requires a process with a non-empty `args`; everything else
/// is optional.
pub fn load_spec(bundle: &Path) -> Result<Spec> {
    let config_path = bundle.join("config.json");
    let spec = Spec::load(&config_path)
        .map_err(|e| RuntimeError::Bundle(format!("{}: {e}", config_path.display())))?;

    let has_args = spec
        .process()
        .as_ref()
        .and_then(|p| p.args().as_ref())
        .is_some_and(|args| !args.is_empty());
    if !has_args {
        return Err(RuntimeError::Bundle(
            "config.json has no process.args".to_string(),
        ));
    }
    Ok(spec)
}

/// Resolve the rootfs directory for a bundle: `root.path` if set (absolute,
/// or relative to the bundle), else `{bundle}/rootfs`.
pub fn rootfs_path(bundle: &Path, spec: &Spec) -> PathBuf {
    match spec.root().as_ref() {
        Some(root) => {
            let p = root.path();
            if p.is_absolute() {
                p.clone()
            } else {
                bundle.join(p)
            }
        }
        None => bundle.join("rootfs"),
    }
}

/// Look up a per-container annotation.
pub fn annotation<'a>(spec: &'a Spec, key: &str) -> Option<&'a str> {
    spec.annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// OCI runtime state, as printed by the `state` verb.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct State<'a> {
    oci_version: &'static str,
    id: &'a str,
    status: Status,
    #[serde(skip_serializing_if = "pid_is_zero")]
    pid: i32,
    bundle: &'a Path,
}

fn pid_is_zero(pid: &i32) -> bool {
    *pid == 0
}

/// JSON-encode the OCI state for a container, using the effective status.
pub fn marshal_state(ctr: &Container) -> Result<String> {
    let state = State {
        oci_version: OCI_VERSION,
        id: &ctr.id,
        status: ctr.effective_status(),
        pid: ctr.pid,
        bundle: &ctr.bundle,
    };
    serde_json::to_string_pretty(&state)
        .map_err(|e| RuntimeError::Internal(format!("marshal OCI state: {e}")))
}
