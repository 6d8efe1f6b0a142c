//! # dbox — rootless container sessions
//!
//! Runs build, test, and debug commands inside a persistent rootless
//! container bound to the current project directory.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use dbox_common::constants::EXIT_INTERNAL;
use dbox_common::error::DboxError;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match commands::execute(cli) {
        Ok(code) => code,
        Err(e) => {
            output::report_error(&e);
            e.downcast_ref::<DboxError>()
                .map_or(EXIT_INTERNAL, DboxError::exit_code)
        }
    };
    ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1))
}

/// Logs go to stderr so they never interleave with relayed command output.
fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
