use tokio::process::Command;
use tracing::trace;

/// Error from a failed external command.
///
/// `detail` carries the combined stdout+stderr of the child so the user sees
/// what the tool itself reported.
#[derive(Debug, thiserror::Error)]
#[error("{program} {args}: {detail}", args = .args.join(" "))]
pub struct CommandError {
    pub program: String,
    pub args: Vec<String>,
    pub detail: String,
}

/// Run an external command, returning trimmed stdout on success.
///
/// On a non-zero exit the error carries the combined stdout+stderr.
pub async fn run(program: &str, args: &[&str]) -> Result<String, CommandError> {
    trace!(program, ?args, "run");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let mut detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        if !detail.is_empty() {
            detail.push('\n');
        }
        detail.push_str(stderr);
    }
    Err(CommandError {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        detail,
    })
}

/// Run an external command, logging any failure instead of returning it.
///
/// Teardown paths use this: errors there must never propagate.
pub async fn run_ignore_errors(program: &str, args: &[&str]) {
    match run(program, args).await {
        Ok(_) => {}
        Err(e) => trace!("command failed (ignored): {e}"),
    }
}
