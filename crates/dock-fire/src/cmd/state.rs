use std::path::Path;

use clap::Args;
use tracing::debug;

use crate::container;
use crate::error::Result;
use crate::oci;

#[derive(Args)]
pub struct StateArgs {
    /// Your name for the instance of the container
    container_id: String,
}

/// Print the OCI state JSON to stdout, reconciling a dead VMM into
/// `stopped`.
pub async fn run_state(root: &Path, args: StateArgs) -> Result<()> {
    let id = &args.container_id;
    debug!(%id, "state");

    let ctr = container::load(root, id)?;
    println!("{}", oci::marshal_state(&ctr)?);
    Ok(())
}
