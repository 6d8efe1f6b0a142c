//! Domain primitive types used across the dbox workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{CONTAINER_NAME_PREFIX, SESSION_KEY_LENGTH};

/// Identifier the container engine assigned to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRef(String);

impl ContainerRef {
    /// Creates a container reference from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable key derived from a canonical working directory.
///
/// Used to name the session record, the lock file, and the container, so
/// that every invocation for the same directory agrees on all three.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derives the key for a canonical working directory.
    #[must_use]
    pub fn for_workdir(workdir: &Path) -> Self {
        let digest = Sha256::digest(workdir.as_os_str().as_encoded_bytes());
        let mut hex = String::with_capacity(SESSION_KEY_LENGTH);
        for byte in digest.iter().take(SESSION_KEY_LENGTH / 2) {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Container name used for the session, e.g. `dbox-1a2b3c4d5e6f`.
    #[must_use]
    pub fn container_name(&self) -> String {
        format!("{CONTAINER_NAME_PREFIX}{}", &self.0[..12])
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exit status of a command executed inside a session.
///
/// Termination by a signal is reported shell-style as `128 + signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Status of a command that exited with `code`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        Self(code)
    }

    /// Numeric exit code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(self) -> bool {
        self.0 == 0
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self(128 + signal);
            }
        }
        Self(status.code().unwrap_or(-1))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

/// Lifecycle state of a session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No container exists for the session.
    Absent,
    /// Container has been created but not yet started.
    Created,
    /// Container is actively running.
    Running,
    /// Container has been stopped.
    Stopped,
    /// Container and record have been removed.
    Removed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    /// Read-write.
    #[default]
    Rw,
    /// Read-only.
    Ro,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rw => write!(f, "rw"),
            Self::Ro => write!(f, "ro"),
        }
    }
}

/// Bind mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountSpec {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Path inside the container.
    pub container_path: PathBuf,
    /// Access mode.
    pub mode: MountMode,
}

impl MountSpec {
    /// Read-write mount of `path` at the same location inside the container.
    #[must_use]
    pub fn identity(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            container_path: path.clone(),
            host_path: path,
            mode: MountMode::Rw,
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path.display(),
            self.mode
        )
    }
}

/// Contiguous block of subordinate IDs allocated to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubordinateRange {
    /// First host ID of the block.
    pub start: u32,
    /// Number of IDs in the block.
    pub count: u32,
}

/// One line of a user-namespace ID map.
///
/// `intermediate_id` is expressed in the rootless namespace's own numbering,
/// where `0` is the invoking user and `1..` are its subordinate IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    /// First ID inside the container.
    pub container_id: u32,
    /// First ID in the rootless namespace.
    pub intermediate_id: u32,
    /// Number of consecutive IDs.
    pub size: u32,
}

impl fmt::Display for IdMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.intermediate_id, self.size)
    }
}

/// Host-to-container identity mapping of a session.
///
/// Computed once when the session is created and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    /// UID of the invoking host user.
    pub host_uid: u32,
    /// GID of the invoking host user.
    pub host_gid: u32,
    /// UID the user has inside the container.
    pub container_uid: u32,
    /// GID the user has inside the container.
    pub container_gid: u32,
    /// Subordinate UIDs backing the namespace.
    pub subuid: SubordinateRange,
    /// Subordinate GIDs backing the namespace.
    pub subgid: SubordinateRange,
    /// UID map passed to the engine.
    pub uid_map: Vec<IdMapEntry>,
    /// GID map passed to the engine.
    pub gid_map: Vec<IdMapEntry>,
}

/// Persistent binding between a host working directory and one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Canonical absolute host path; the natural key.
    pub workdir: PathBuf,
    /// Engine-assigned identifier, absent until the container is created.
    pub container_ref: Option<ContainerRef>,
    /// Deterministic container name.
    pub container_name: String,
    /// Image reference the container is created from.
    pub image: String,
    /// Bind mounts; the first is always the working directory.
    pub mounts: Vec<MountSpec>,
    /// Identity mapping fixed at creation.
    pub identity: IdentityMapping,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state transition.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Creates a new session in the `Absent` state.
    #[must_use]
    pub fn new(
        workdir: PathBuf,
        image: String,
        mounts: Vec<MountSpec>,
        identity: IdentityMapping,
    ) -> Self {
        let now = Utc::now();
        Self {
            container_name: SessionKey::for_workdir(&workdir).container_name(),
            workdir,
            container_ref: None,
            image,
            mounts,
            identity,
            state: SessionState::Absent,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key used for the record, lock, and container name.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::for_workdir(&self.workdir)
    }

    /// Records a state transition.
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
