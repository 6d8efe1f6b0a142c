//! User namespace identity mapping.
//!
//! Maps the invoking host user onto the same UID/GID inside a rootless
//! container, using the subordinate ID ranges the host allocated to that user
//! for every other ID in the namespace.

use std::path::{Path, PathBuf};

use dbox_common::config::DboxConfig;
use dbox_common::error::{DboxError, Result};
use dbox_common::types::{IdMapEntry, IdentityMapping, SubordinateRange};

/// Resolves identity mappings from the host's subordinate ID allocation files.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    subuid_path: PathBuf,
    subgid_path: PathBuf,
}

impl IdentityResolver {
    /// Creates a resolver reading the given allocation files.
    #[must_use]
    pub fn new(subuid_path: impl Into<PathBuf>, subgid_path: impl Into<PathBuf>) -> Self {
        Self {
            subuid_path: subuid_path.into(),
            subgid_path: subgid_path.into(),
        }
    }

    /// Creates a resolver using the paths from the configuration.
    #[must_use]
    pub fn from_config(config: &DboxConfig) -> Self {
        Self::new(&config.subuid_path, &config.subgid_path)
    }

    /// Resolves the mapping for the given host identity.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::NoSubordinateRange` if either allocation file has no
    /// entry for the user, and `DboxError::MalformedIdentity` if the allocated
    /// range is too small to hold the user's own ID.
    pub fn resolve(&self, host_uid: u32, host_gid: u32) -> Result<IdentityMapping> {
        let user = user_name(host_uid);
        let subuid = lookup_range(&self.subuid_path, "uid", &user, host_uid)?;
        let subgid = lookup_range(&self.subgid_path, "gid", &user, host_uid)?;

        let mapping = IdentityMapping {
            host_uid,
            host_gid,
            container_uid: host_uid,
            container_gid: host_gid,
            subuid,
            subgid,
            uid_map: keep_id_map("uid", host_uid, subuid)?,
            gid_map: keep_id_map("gid", host_gid, subgid)?,
        };
        tracing::debug!(
            user = %user,
            host_uid,
            host_gid,
            subuid_start = subuid.start,
            subuid_count = subuid.count,
            "resolved identity mapping"
        );
        Ok(mapping)
    }

    /// Resolves the mapping for the identity of the calling process.
    ///
    /// # Errors
    ///
    /// See [`IdentityResolver::resolve`].
    pub fn resolve_current(&self) -> Result<IdentityMapping> {
        let (uid, gid) = current_identity();
        self.resolve(uid, gid)
    }
}

/// Returns the real UID and GID of the calling process.
#[must_use]
pub fn current_identity() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

/// Checks that a stored mapping is usable by the engine.
///
/// # Errors
///
/// Returns `DboxError::MalformedIdentity` if a map is empty, does not map the
/// container identity back to the invoking user, or needs more subordinate
/// IDs than were allocated.
pub fn validate_mapping(mapping: &IdentityMapping) -> Result<()> {
    check_map("uid", &mapping.uid_map, mapping.container_uid, mapping.subuid)?;
    check_map("gid", &mapping.gid_map, mapping.container_gid, mapping.subgid)
}

fn check_map(kind: &str, map: &[IdMapEntry], own_id: u32, range: SubordinateRange) -> Result<()> {
    if map.is_empty() {
        return Err(DboxError::MalformedIdentity {
            message: format!("{kind} map is empty"),
        });
    }
    let maps_self = map
        .iter()
        .any(|e| e.intermediate_id == 0 && e.container_id == own_id && e.size == 1);
    if !maps_self {
        return Err(DboxError::MalformedIdentity {
            message: format!("{kind} map does not map container {kind} {own_id} to the host user"),
        });
    }
    let total: u64 = map.iter().map(|e| u64::from(e.size)).sum();
    if total > u64::from(range.count) + 1 {
        return Err(DboxError::MalformedIdentity {
            message: format!(
                "{kind} map covers {total} ids but only {} subordinate ids are allocated",
                range.count
            ),
        });
    }
    Ok(())
}

/// Builds a map that keeps `id` unchanged inside the container.
///
/// Container IDs below `id` come from the start of the subordinate range,
/// `id` itself is the invoking user, and IDs above `id` continue the range.
fn keep_id_map(kind: &str, id: u32, range: SubordinateRange) -> Result<Vec<IdMapEntry>> {
    if range.count <= id {
        return Err(DboxError::MalformedIdentity {
            message: format!(
                "subordinate {kind} range of {} ids cannot hold container {kind} {id}",
                range.count
            ),
        });
    }
    let mut map = Vec::with_capacity(3);
    if id > 0 {
        map.push(IdMapEntry {
            container_id: 0,
            intermediate_id: 1,
            size: id,
        });
    }
    map.push(IdMapEntry {
        container_id: id,
        intermediate_id: 0,
        size: 1,
    });
    map.push(IdMapEntry {
        container_id: id + 1,
        intermediate_id: id + 1,
        size: range.count - id,
    });
    Ok(map)
}

fn user_name(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Finds the first allocation for `user` (by name or numeric UID) in a
/// `/etc/subuid`-style file.
fn lookup_range(path: &Path, kind: &'static str, user: &str, uid: u32) -> Result<SubordinateRange> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(DboxError::io(path, e)),
    };
    let uid_str = uid.to_string();
    parse_allocations(&content)
        .find(|(owner, _)| *owner == user || *owner == uid_str)
        .map(|(_, range)| range)
        .ok_or_else(|| DboxError::NoSubordinateRange {
            kind,
            user: user.to_string(),
            path: path.to_path_buf(),
        })
}

fn parse_allocations(content: &str) -> impl Iterator<Item = (&str, SubordinateRange)> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split(':');
        let owner = fields.next()?;
        let start = fields.next()?.trim().parse().ok();
        let count = fields.next()?.trim().parse().ok();
        match (start, count, fields.next()) {
            (Some(start), Some(count), None) if count > 0 => {
                Some((owner, SubordinateRange { start, count }))
            }
            _ => {
                tracing::debug!(line, "skipping malformed subordinate id entry");
                None
            }
        }
    })
}
