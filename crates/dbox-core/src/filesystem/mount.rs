//! Bind mount specifications for session containers.
//!
//! Parses user-supplied mount strings, validates them against the host
//! filesystem, and translates host paths to their location inside the
//! container.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use dbox_common::error::{DboxError, Result};
use dbox_common::types::{MountMode, MountSpec};

/// Parses a mount in `HOST[:CONTAINER][:ro|rw]` form.
///
/// The host path is not checked here; see [`resolve_mount`].
///
/// # Errors
///
/// Returns `DboxError::InvalidMount` if the string has too many fields, an
/// empty field, or an unknown mode.
pub fn parse_mount_spec(spec: &str) -> Result<MountSpec> {
    let invalid = |reason: &str| DboxError::InvalidMount {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.iter().any(|f| f.is_empty()) {
        return Err(invalid("empty field"));
    }
    let (host, container, mode) = match fields.as_slice() {
        [host] => (*host, *host, MountMode::Rw),
        [host, "ro"] => (*host, *host, MountMode::Ro),
        [host, "rw"] => (*host, *host, MountMode::Rw),
        [host, container] => (*host, *container, MountMode::Rw),
        [host, container, mode] => {
            let mode = parse_mode(mode).ok_or_else(|| invalid("mode must be ro or rw"))?;
            (*host, *container, mode)
        }
        _ => return Err(invalid("expected HOST[:CONTAINER][:ro|rw]")),
    };
    Ok(MountSpec {
        host_path: PathBuf::from(host),
        container_path: PathBuf::from(container),
        mode,
    })
}

fn parse_mode(mode: &str) -> Option<MountMode> {
    match mode {
        "ro" => Some(MountMode::Ro),
        "rw" => Some(MountMode::Rw),
        _ => None,
    }
}

/// Canonicalizes the host side of a mount.
///
/// # Errors
///
/// Returns `DboxError::InvalidMount` if the host path does not exist or the
/// container path is not absolute.
pub fn resolve_mount(mut mount: MountSpec) -> Result<MountSpec> {
    let host = std::fs::canonicalize(&mount.host_path).map_err(|e| DboxError::InvalidMount {
        spec: mount.to_string(),
        reason: format!("host path cannot be resolved: {e}"),
    })?;
    if mount.container_path == mount.host_path {
        mount.container_path.clone_from(&host);
    }
    mount.host_path = host;
    if !mount.container_path.is_absolute() {
        return Err(DboxError::InvalidMount {
            spec: mount.to_string(),
            reason: "container path must be absolute".into(),
        });
    }
    Ok(mount)
}

/// Builds the mount list of a new session: the working directory first,
/// followed by the extra mounts.
///
/// # Errors
///
/// Returns `DboxError::InvalidMount` if any extra mount is malformed or
/// unresolvable, or if two mounts target the same container path.
pub fn session_mounts(workdir: &Path, extra: &[String]) -> Result<Vec<MountSpec>> {
    let mut mounts = vec![MountSpec::identity(workdir)];
    for spec in extra {
        mounts.push(resolve_mount(parse_mount_spec(spec)?)?);
    }
    validate_mounts(&mounts)?;
    Ok(mounts)
}

/// Validates a mount list before a container is created from it.
///
/// # Errors
///
/// Returns `DboxError::InvalidMount` if a host path is missing, a container
/// path is relative, or two mounts collide on the same container path.
pub fn validate_mounts(mounts: &[MountSpec]) -> Result<()> {
    let mut targets = HashSet::with_capacity(mounts.len());
    for mount in mounts {
        if !mount.host_path.exists() {
            return Err(DboxError::InvalidMount {
                spec: mount.to_string(),
                reason: "host path does not exist".into(),
            });
        }
        if !mount.container_path.is_absolute() {
            return Err(DboxError::InvalidMount {
                spec: mount.to_string(),
                reason: "container path must be absolute".into(),
            });
        }
        if !targets.insert(normalize(&mount.container_path)) {
            return Err(DboxError::InvalidMount {
                spec: mount.to_string(),
                reason: format!(
                    "container path {} is already used by another mount",
                    mount.container_path.display()
                ),
            });
        }
    }
    tracing::debug!(count = mounts.len(), "mounts validated");
    Ok(())
}

/// Translates a host path to the container path it is visible at.
///
/// The mount with the longest matching host prefix wins, so a nested mount
/// shadows its parent.
#[must_use]
pub fn container_path_for(mounts: &[MountSpec], host_path: &Path) -> Option<PathBuf> {
    mounts
        .iter()
        .filter_map(|m| {
            host_path
                .strip_prefix(&m.host_path)
                .ok()
                .map(|rest| {
                    let path = if rest.as_os_str().is_empty() {
                        m.container_path.clone()
                    } else {
                        m.container_path.join(rest)
                    };
                    (m.host_path.components().count(), path)
                })
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, path)| path)
}

/// Lexically normalizes a path, dropping `.` and resolving `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_only() {
        let m = parse_mount_spec("/opt/sdk").expect("parse");
        assert_eq!(m.host_path, m.container_path);
        assert_eq!(m.mode, MountMode::Rw);
    }

    #[test]
    fn parse_host_and_mode() {
        let m = parse_mount_spec("/opt/sdk:ro").expect("parse");
        assert_eq!(m.container_path, PathBuf::from("/opt/sdk"));
        assert_eq!(m.mode, MountMode::Ro);
    }

    #[test]
    fn parse_full_form() {
        let m = parse_mount_spec("/opt/sdk:/sdk:ro").expect("parse");
        assert_eq!(m.host_path, PathBuf::from("/opt/sdk"));
        assert_eq!(m.container_path, PathBuf::from("/sdk"));
        assert_eq!(m.mode, MountMode::Ro);
    }

    #[test]
    fn parse_rejects_bad_mode_and_extra_fields() {
        assert!(parse_mount_spec("/a:/b:rx").is_err());
        assert!(parse_mount_spec("/a:/b:ro:z").is_err());
        assert!(parse_mount_spec("/a::ro").is_err());
    }

    #[test]
    fn resolve_rejects_missing_host_path() {
        let err = resolve_mount(MountSpec::identity("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, DboxError::InvalidMount { .. }));
    }

    #[test]
    fn resolve_rejects_relative_container_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = format!("{}:relative", dir.path().display());
        let err = resolve_mount(parse_mount_spec(&spec).expect("parse")).unwrap_err();
        assert!(matches!(err, DboxError::InvalidMount { .. }));
    }

    #[test]
    fn session_mounts_puts_workdir_first() {
        let work = tempfile::tempdir().expect("workdir");
        let extra = tempfile::tempdir().expect("extra");
        let workdir = std::fs::canonicalize(work.path()).expect("canonical");
        let spec = format!("{}:/data:ro", extra.path().display());

        let mounts = session_mounts(&workdir, &[spec]).expect("mounts");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0], MountSpec::identity(&workdir));
        assert_eq!(mounts[1].container_path, PathBuf::from("/data"));
    }

    #[test]
    fn colliding_container_paths_are_rejected() {
        let a = tempfile::tempdir().expect("a");
        let b = tempfile::tempdir().expect("b");
        let mounts = vec![
            MountSpec {
                host_path: a.path().to_path_buf(),
                container_path: PathBuf::from("/data"),
                mode: MountMode::Rw,
            },
            MountSpec {
                host_path: b.path().to_path_buf(),
                container_path: PathBuf::from("/data/./"),
                mode: MountMode::Ro,
            },
        ];
        let err = validate_mounts(&mounts).unwrap_err();
        assert!(matches!(err, DboxError::InvalidMount { .. }));
    }

    #[test]
    fn container_path_prefers_deepest_mount() {
        let mounts = vec![
            MountSpec::identity("/home/dev/proj"),
            MountSpec {
                host_path: PathBuf::from("/home/dev/proj/vendor"),
                container_path: PathBuf::from("/vendor"),
                mode: MountMode::Ro,
            },
        ];
        assert_eq!(
            container_path_for(&mounts, Path::new("/home/dev/proj/src")),
            Some(PathBuf::from("/home/dev/proj/src"))
        );
        assert_eq!(
            container_path_for(&mounts, Path::new("/home/dev/proj/vendor/lib")),
            Some(PathBuf::from("/vendor/lib"))
        );
        assert_eq!(
            container_path_for(&mounts, Path::new("/home/dev/proj")),
            Some(PathBuf::from("/home/dev/proj"))
        );
        assert_eq!(container_path_for(&mounts, Path::new("/etc")), None);
    }
}
