//! CLI command definitions and dispatch.

pub mod list;
pub mod rm;
pub mod run;
pub mod status;
pub mod stop;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use dbox_common::config::DboxConfig;
use dbox_runtime::backend::detect_engine;
use dbox_runtime::session::SessionManager;

/// dbox — run commands in a persistent rootless container per project.
#[derive(Parser, Debug)]
#[command(name = "dbox", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding session records, locks, and `config.json`.
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds to wait for another invocation holding the session.
    #[arg(long, global = true, value_name = "SECS")]
    pub lock_timeout: Option<u64>,

    /// Container engine binary name or path.
    #[arg(long, global = true, value_name = "BINARY")]
    pub engine: Option<String>,

    /// Increase log verbosity (`-v` debug, `-vv` trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in the session of a directory, creating it if needed.
    Run(run::RunArgs),
    /// Stop the session container.
    Stop(stop::StopArgs),
    /// Remove the session container and its record.
    Rm(rm::RmArgs),
    /// Show the session of a directory.
    Status(status::StatusArgs),
    /// List all sessions.
    List(list::ListArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// Returns the process exit code.
///
/// # Errors
///
/// Returns an error if configuration loading or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Stop(args) => stop::execute(&args, config),
        Command::Rm(args) => rm::execute(&args, config),
        Command::Status(args) => status::execute(&args, config),
        Command::List(args) => list::execute(&args, config),
    }
}

/// Layers command-line flags over the file and environment configuration.
fn load_config(cli: &Cli) -> anyhow::Result<DboxConfig> {
    let mut config = DboxConfig::load(cli.data_dir.clone())?;
    if let Some(engine) = &cli.engine {
        config.engine_binary.clone_from(engine);
    }
    if let Some(secs) = cli.lock_timeout {
        config.lock_timeout_secs = secs;
    }
    Ok(config)
}

/// Builds a session manager on top of the configured engine.
pub(crate) fn session_manager(config: DboxConfig) -> anyhow::Result<SessionManager> {
    let engine = detect_engine(&config)?;
    tracing::debug!(engine = %engine.binary().display(), "using container engine");
    Ok(SessionManager::new(config, Arc::new(engine)))
}

/// Resolves an optional `--workdir` flag against the current directory.
pub(crate) fn workdir_or_current(workdir: Option<&PathBuf>) -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    Ok(workdir.map_or_else(|| cwd.clone(), |dir| cwd.join(dir)))
}
