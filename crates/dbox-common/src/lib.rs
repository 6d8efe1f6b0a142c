//! # dbox-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire dbox workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the session model, identity and mount value
//! types, and the error taxonomy that every other crate reports through.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
