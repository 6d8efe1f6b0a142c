//! System-wide constants and default paths.

use std::path::PathBuf;

/// Application name used in state directories and container labels.
pub const APP_NAME: &str = "dbox";

/// Image used when neither the config file nor the command line selects one.
pub const DEFAULT_IMAGE: &str = "registry.fedoraproject.org/fedora:latest";

/// Container engine binary looked up on `PATH`.
pub const DEFAULT_ENGINE: &str = "podman";

/// Host subordinate UID allocation file.
pub const SUBUID_PATH: &str = "/etc/subuid";

/// Host subordinate GID allocation file.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// Seconds an invocation waits for a session lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Prefix of every container name managed by dbox.
pub const CONTAINER_NAME_PREFIX: &str = "dbox-";

/// Label recording the host working directory a container is bound to.
pub const LABEL_WORKDIR: &str = "io.github.dbox.workdir";

/// Command the session container idles on between executions.
pub const IDLE_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// Number of hex characters of the workdir digest used for file and container names.
pub const SESSION_KEY_LENGTH: usize = 16;

/// Exit code: the working directory is outside every mount.
pub const EXIT_PATH_NOT_MOUNTED: i32 = 119;
/// Exit code: internal failure (I/O, corrupt state).
pub const EXIT_INTERNAL: i32 = 120;
/// Exit code: configuration error (subordinate ranges, mounts, identity).
pub const EXIT_CONFIGURATION: i32 = 121;
/// Exit code: container engine failure.
pub const EXIT_ENGINE: i32 = 122;
/// Exit code: the session lock could not be acquired in time.
pub const EXIT_LOCK_TIMEOUT: i32 = 123;
/// Exit code: the container disappeared before the command could start.
pub const EXIT_SESSION_VANISHED: i32 = 124;
/// Exit code: the invocation was interrupted before the command started.
pub const EXIT_CANCELLED: i32 = 130;

/// Returns the default data directory.
///
/// Prefers `$XDG_DATA_HOME/dbox`, then `$HOME/.local/share/dbox`, and falls
/// back to a directory under the system temp dir when neither is set.
pub fn default_data_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(APP_NAME);
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local").join("share").join(APP_NAME);
    }
    std::env::temp_dir().join(APP_NAME)
}
