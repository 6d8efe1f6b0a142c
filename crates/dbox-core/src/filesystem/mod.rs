//! Filesystem management: bind mounts between host and container.

pub mod mount;
