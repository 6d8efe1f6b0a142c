//! `dbox run` — Run a command in the session of a directory.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use dbox_common::config::DboxConfig;
use dbox_runtime::exec::ExecIo;
use dbox_runtime::session::RunRequest;

use super::{session_manager, workdir_or_current};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image for a new session.
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Extra bind mount for a new session, as `HOST[:CONTAINER][:ro|rw]`.
    #[arg(long = "mount", value_name = "SPEC")]
    pub mounts: Vec<String>,

    /// Environment variable for the command; `KEY` alone copies the host value.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Directory whose session to use (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Command and arguments to run, after `--`.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Executes the `run` command and returns the command's exit status.
///
/// # Errors
///
/// Returns an error if the session cannot be brought up or the command
/// cannot be launched.
pub fn execute(args: RunArgs, config: DboxConfig) -> anyhow::Result<i32> {
    let current = workdir_or_current(None)?;
    let workdir = workdir_or_current(args.workdir.as_ref())?;
    // Stay in the current directory when it belongs to the session.
    let cwd = if current.starts_with(&workdir) {
        current
    } else {
        workdir.clone()
    };

    let mut command = args.command.into_iter();
    let program = command.next().context("no command given")?;
    let mut request = RunRequest::new(workdir, program)
        .with_args(command)
        .with_cwd(cwd);
    request.env = args.env;
    request.image = args.image;
    request.mounts = args.mounts;

    let manager = session_manager(config)?;
    let signals = manager.signals().clone();
    ctrlc::set_handler(move || signals.interrupt())
        .context("failed to install the interrupt handler")?;

    let status = manager.run(&request, ExecIo::inherit(manager.signals().clone()))?;
    tracing::debug!(code = status.code(), "command exited");
    Ok(status.code())
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some(("", _)) => Err(format!("missing variable name in {raw:?}")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => std::env::var(raw)
            .map(|value| (raw.to_string(), value))
            .map_err(|_| format!("{raw} is not set in the host environment")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        assert_eq!(
            parse_env("OPTS=-O2=fast").unwrap(),
            ("OPTS".to_string(), "-O2=fast".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env("=value").is_err());
    }

    #[test]
    fn bare_env_key_copies_host_value() {
        let (key, value) = parse_env("PATH").unwrap();
        assert_eq!(key, "PATH");
        assert_eq!(value, std::env::var("PATH").unwrap());
        assert!(parse_env("DBOX_SURELY_UNSET_VARIABLE").is_err());
    }
}
