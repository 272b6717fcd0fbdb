use std::path::Path;

use clap::Args;
use tracing::{debug, info};

use crate::container::{self, Status};
use crate::error::{Result, RuntimeError};

#[derive(Args)]
pub struct StartArgs {
    /// Your name for the instance of the container
    container_id: String,
}

/// The VM already booted during `create`; `start` only moves the record to
/// `running` so the supervisor's view matches.
pub async fn run_start(root: &Path, args: StartArgs) -> Result<()> {
    let id = &args.container_id;
    debug!(%id, "start");

    let mut ctr = container::load(root, id)?;
    if ctr.status != Status::Created {
        return Err(RuntimeError::InvalidState {
            id: id.clone(),
            expected: "created",
            actual: ctr.status.to_string(),
        });
    }

    ctr.transition(Status::Running)?;
    ctr.save()?;

    info!(%id, pid = ctr.pid, "container started");
    Ok(())
}
