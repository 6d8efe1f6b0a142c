//! `dbox status` — Show the session of a directory.

use std::path::PathBuf;

use clap::Args;
use dbox_common::config::DboxConfig;

use super::{session_manager, workdir_or_current};
use crate::output;

/// Arguments for the `status` command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Directory whose session to show (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,
}

/// Executes the `status` command.
///
/// # Errors
///
/// Returns an error if there is no session or its container cannot be inspected.
pub fn execute(args: &StatusArgs, config: DboxConfig) -> anyhow::Result<i32> {
    let workdir = workdir_or_current(args.workdir.as_ref())?;
    let session = session_manager(config)?.status(&workdir)?;
    output::print_lines(&output::session_details(&session));
    Ok(0)
}
