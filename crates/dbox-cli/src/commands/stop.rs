//! `dbox stop` — Stop the session container of a directory.

use std::path::PathBuf;

use clap::Args;
use dbox_common::config::DboxConfig;

use super::{session_manager, workdir_or_current};
use crate::output;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Directory whose session to stop (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if there is no session or the container cannot be stopped.
pub fn execute(args: &StopArgs, config: DboxConfig) -> anyhow::Result<i32> {
    let workdir = workdir_or_current(args.workdir.as_ref())?;
    let session = session_manager(config)?.stop(&workdir)?;
    output::notice(&format!(
        "stopped {} ({})",
        session.container_name,
        session.workdir.display()
    ));
    Ok(0)
}
