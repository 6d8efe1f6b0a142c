//! Session management for the dbox toolbox.
//!
//! Maps host working directories to persistent rootless containers and runs
//! commands inside them. [`session::SessionManager`] is the entry point;
//! the other modules are its building blocks:
//!
//! - [`state`]: per-workdir session records
//! - [`lock`]: cross-process session locks
//! - [`lifecycle`]: container state machine
//! - [`exec`]: command execution and stdio relay
//! - [`backend`]: container engine implementations

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backend;
pub mod exec;
pub mod lifecycle;
pub mod lock;
pub mod retry;
pub mod session;
pub mod state;
