//! `dbox rm` — Remove the session of a directory.

use std::path::PathBuf;

use clap::Args;
use dbox_common::config::DboxConfig;

use super::{session_manager, workdir_or_current};
use crate::output;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Directory whose session to remove (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,
}

/// Executes the `rm` command. Removing a directory without a session succeeds.
///
/// # Errors
///
/// Returns an error if the container exists but cannot be removed.
pub fn execute(args: &RmArgs, config: DboxConfig) -> anyhow::Result<i32> {
    let workdir = workdir_or_current(args.workdir.as_ref())?;
    match session_manager(config)?.remove(&workdir)? {
        Some(session) => output::notice(&format!(
            "removed {} ({})",
            session.container_name,
            session.workdir.display()
        )),
        None => output::notice(&format!("no session for {}", workdir.display())),
    }
    Ok(0)
}
