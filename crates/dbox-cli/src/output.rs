//! Formatted output helpers for CLI commands.
//!
//! Formatting is kept separate from printing so tables can be tested.
//! Tables go to stdout; notices and errors go to stderr.

use chrono::{DateTime, Utc};
use dbox_common::types::Session;

/// Prints lines to stdout.
#[allow(clippy::print_stdout)]
pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

/// Prints an informational message to stderr.
#[allow(clippy::print_stderr)]
pub fn notice(message: &str) {
    eprintln!("{message}");
}

/// Prints a failure, with its cause chain, to stderr.
#[allow(clippy::print_stderr)]
pub fn report_error(error: &anyhow::Error) {
    eprintln!("dbox: {error:#}");
}

/// Formats a timestamp as a coarse age such as `5m ago`.
#[must_use]
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3_600 => format!("{}m ago", secs / 60),
        3_600..86_400 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Renders sessions as a table, one row per session.
#[must_use]
pub fn session_table(sessions: &[Session]) -> Vec<String> {
    let now = Utc::now();
    let mut lines = vec![format!(
        "{:<18} {:<9} {:<12} {:<30} {}",
        "NAME", "STATE", "UPDATED", "IMAGE", "WORKDIR"
    )];
    lines.extend(sessions.iter().map(|s| {
        format!(
            "{:<18} {:<9} {:<12} {:<30} {}",
            s.container_name,
            s.state.to_string(),
            format_age(s.updated_at, now),
            s.image,
            s.workdir.display()
        )
    }));
    lines
}

/// Renders one session as `key: value` lines.
#[must_use]
pub fn session_details(session: &Session) -> Vec<String> {
    let identity = &session.identity;
    let mut lines = vec![
        format!("workdir:   {}", session.workdir.display()),
        format!("container: {}", session.container_name),
        format!(
            "id:        {}",
            session
                .container_ref
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string)
        ),
        format!("state:     {}", session.state),
        format!("image:     {}", session.image),
        format!(
            "identity:  {}:{} -> {}:{} (subuid {}+{}, subgid {}+{})",
            identity.host_uid,
            identity.host_gid,
            identity.container_uid,
            identity.container_gid,
            identity.subuid.start,
            identity.subuid.count,
            identity.subgid.start,
            identity.subgid.count
        ),
        format!("created:   {}", session.created_at.to_rfc3339()),
        format!("updated:   {}", session.updated_at.to_rfc3339()),
    ];
    lines.extend(session.mounts.iter().map(|m| format!("mount:     {m}")));
    lines
}
