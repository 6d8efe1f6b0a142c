//! Linux namespace configuration for rootless session containers.

pub mod user;

pub use user::{IdentityResolver, current_identity, validate_mapping};
