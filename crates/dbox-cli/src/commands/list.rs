//! `dbox list` — List all sessions.

use clap::Args;
use dbox_common::config::DboxConfig;
use dbox_common::types::SessionState;

use super::session_manager;
use crate::output;

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show sessions whose container is running.
    #[arg(long)]
    pub running: bool,
}

/// Executes the `list` command.
///
/// # Errors
///
/// Returns an error if the session records cannot be read.
pub fn execute(args: &ListArgs, config: DboxConfig) -> anyhow::Result<i32> {
    let sessions: Vec<_> = session_manager(config)?
        .list()?
        .into_iter()
        .filter(|s| !args.running || s.state == SessionState::Running)
        .collect();

    if sessions.is_empty() {
        output::notice("No sessions found.");
        return Ok(0);
    }
    output::print_lines(&output::session_table(&sessions));
    Ok(0)
}
