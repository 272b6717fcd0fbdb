//! The init configuration written into the rootfs image by the host
//! runtime, plus command resolution against PATH.

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const CONFIG_PATH: &str = "/etc/dock-fire/config.json";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_TERM: &str = "TERM=xterm";

#[derive(Debug, Deserialize)]
pub struct InitConfig {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
}

/// Parse and validate the init config.
pub fn parse(data: &str) -> Result<InitConfig, String> {
    let cfg: InitConfig = serde_json::from_str(data).map_err(|e| format!("parse config: {e}"))?;
    if cfg.args.is_empty() {
        return Err("no command specified".to_string());
    }
    Ok(cfg)
}

/// The environment for the child: the configured one, or a minimal default
/// when the bundle supplied none.
pub fn effective_env(cfg: &InitConfig) -> Vec<String> {
    if cfg.env.is_empty() {
        vec![DEFAULT_PATH.to_string(), DEFAULT_TERM.to_string()]
    } else {
        cfg.env.clone()
    }
}

/// Split `KEY=VALUE` entries; an entry without `=` becomes an empty value.
pub fn env_pairs(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .map(|e| match e.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (e.clone(), String::new()),
        })
        .collect()
}

/// The PATH value from an environment list.
pub fn path_var(env: &[String]) -> Option<&str> {
    env.iter().find_map(|e| e.strip_prefix("PATH="))
}

/// Resolve a program name the way `execvp` would: names containing `/` are
/// used as-is, everything else is searched in PATH. Only executable regular
/// files match.
pub fn resolve_program(name: &str, path: Option<&str>) -> Option<PathBuf> {
    if name.contains('/') {
        let p = PathBuf::from(name);
        return is_executable(&p).then_some(p);
    }
    for dir in path?.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
