//! # dbox-core
//!
//! Host-side isolation primitives for dbox sessions.
//!
//! This crate provides:
//! - **Namespaces**: resolving the rootless user namespace identity mapping
//!   from the host's subordinate ID allocations.
//! - **Filesystem**: parsing, validating, and translating bind mounts between
//!   the host and the container.
//!
//! Nothing here talks to the container engine; these are pure functions of
//! host configuration that the runtime crate feeds into the engine.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filesystem;
pub mod namespace;
