//! Unified error types for the dbox workspace.
//!
//! Every failure a session operation can report is a [`DboxError`]. Variants
//! are grouped into an [`ErrorKind`] so callers can decide between retrying,
//! reporting a configuration problem, or mapping to a reserved exit code.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The invoking user has no subordinate ID range allocated.
    #[error("no subordinate {kind} range configured for user {user} in {path}")]
    NoSubordinateRange {
        /// `uid` or `gid`.
        kind: &'static str,
        /// User the lookup was made for.
        user: String,
        /// Allocation file that was consulted.
        path: PathBuf,
    },

    /// A mount specification is unusable.
    #[error("invalid mount {spec}: {reason}")]
    InvalidMount {
        /// Mount as given by the user or recorded in the session.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The host identity no longer matches the one the session was created with.
    #[error(
        "host identity {host_uid}:{host_gid} differs from session identity \
         {recorded_uid}:{recorded_gid} for {workdir}; remove the session to recreate it"
    )]
    IdentityChanged {
        /// Session working directory.
        workdir: PathBuf,
        /// UID stored in the session.
        recorded_uid: u32,
        /// GID stored in the session.
        recorded_gid: u32,
        /// UID of the current invocation.
        host_uid: u32,
        /// GID of the current invocation.
        host_gid: u32,
    },

    /// The identity mapping cannot be expressed with the available ranges.
    #[error("malformed identity mapping: {message}")]
    MalformedIdentity {
        /// Description of the problem.
        message: String,
    },

    /// The container engine is busy or temporarily unreachable.
    #[error("container engine {operation} failed (transient): {message}")]
    EngineTransient {
        /// Engine operation that failed.
        operation: &'static str,
        /// Engine diagnostic.
        message: String,
    },

    /// The container engine rejected the request.
    #[error("container engine {operation} failed: {message}")]
    EngineFatal {
        /// Engine operation that failed.
        operation: &'static str,
        /// Engine diagnostic.
        message: String,
    },

    /// The session image is not available locally.
    #[error("image not found: {image} (pull or build it first)")]
    ImageNotFound {
        /// Image reference.
        image: String,
    },

    /// The engine has no container with the given reference.
    #[error("container not found: {container}")]
    ContainerNotFound {
        /// Container reference.
        container: String,
    },

    /// Another container already uses the session's container name.
    #[error("container name {name} is already in use")]
    NameConflict {
        /// Conflicting container name.
        name: String,
    },

    /// The session lock stayed busy for the whole timeout.
    #[error("timed out after {waited:?} waiting for the session lock of {workdir}")]
    LockTimeout {
        /// Session working directory.
        workdir: PathBuf,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The container disappeared between confirmation and execution.
    #[error("session container {container} vanished before the command could start")]
    SessionVanished {
        /// Container reference taken at confirmation time.
        container: String,
    },

    /// The working directory is outside every mount of the session.
    #[error("{path} is not under any mount of this session")]
    PathNotMounted {
        /// Host path that could not be mapped.
        path: PathBuf,
    },

    /// No session exists for the working directory.
    #[error("no session for {workdir}")]
    SessionNotFound {
        /// Working directory that was looked up.
        workdir: PathBuf,
    },

    /// The invocation was interrupted before the command started.
    #[error("interrupted")]
    Cancelled,

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Coarse classification of a [`DboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Host or user configuration problem; never retried.
    Configuration,
    /// Engine busy; retried with backoff.
    EngineTransient,
    /// Engine refused the request; never retried.
    EngineFatal,
    /// Lock acquisition timed out.
    LockTimeout,
    /// Container vanished mid-invocation.
    SessionVanished,
    /// Working directory outside the mounts.
    PathNotMounted,
    /// Interrupted by a signal.
    Cancelled,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration error",
            Self::EngineTransient => "transient engine error",
            Self::EngineFatal => "engine error",
            Self::LockTimeout => "lock timeout",
            Self::SessionVanished => "session vanished",
            Self::PathNotMounted => "path not mounted",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

impl DboxError {
    /// Wraps an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the classification of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. }
            | Self::NoSubordinateRange { .. }
            | Self::InvalidMount { .. }
            | Self::IdentityChanged { .. } => ErrorKind::Configuration,
            Self::EngineTransient { .. } => ErrorKind::EngineTransient,
            Self::EngineFatal { .. }
            | Self::ImageNotFound { .. }
            | Self::MalformedIdentity { .. }
            | Self::ContainerNotFound { .. }
            | Self::NameConflict { .. } => ErrorKind::EngineFatal,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::SessionVanished { .. } => ErrorKind::SessionVanished,
            Self::PathNotMounted { .. } => ErrorKind::PathNotMounted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io { .. } | Self::SessionNotFound { .. } | Self::Serialization { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the failed operation may succeed if simply tried again.
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::EngineTransient)
    }

    /// Reserved process exit code for this error.
    pub const fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => constants::EXIT_CONFIGURATION,
            ErrorKind::EngineTransient | ErrorKind::EngineFatal => constants::EXIT_ENGINE,
            ErrorKind::LockTimeout => constants::EXIT_LOCK_TIMEOUT,
            ErrorKind::SessionVanished => constants::EXIT_SESSION_VANISHED,
            ErrorKind::PathNotMounted => constants::EXIT_PATH_NOT_MOUNTED,
            ErrorKind::Cancelled => constants::EXIT_CANCELLED,
            ErrorKind::Internal => constants::EXIT_INTERNAL,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_share_exit_code() {
        let missing = DboxError::NoSubordinateRange {
            kind: "uid",
            user: "dev".into(),
            path: "/etc/subuid".into(),
        };
        let mount = DboxError::InvalidMount {
            spec: "/nope".into(),
            reason: "does not exist".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::Configuration);
        assert_eq!(missing.exit_code(), mount.exit_code());
    }

    #[test]
    fn only_engine_transient_is_retryable() {
        let busy = DboxError::EngineTransient {
            operation: "create",
            message: "database is locked".into(),
        };
        let image = DboxError::ImageNotFound {
            image: "fedora".into(),
        };
        assert!(busy.is_transient());
        assert!(!image.is_transient());
        assert!(!DboxError::Cancelled.is_transient());
    }

    #[test]
    fn reserved_exit_codes_are_distinct() {
        let codes = [
            DboxError::LockTimeout {
                workdir: "/proj".into(),
                waited: Duration::from_secs(1),
            }
            .exit_code(),
            DboxError::SessionVanished {
                container: "abc".into(),
            }
            .exit_code(),
            DboxError::PathNotMounted {
                path: "/tmp".into(),
            }
            .exit_code(),
            DboxError::Config {
                message: "x".into(),
            }
            .exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
