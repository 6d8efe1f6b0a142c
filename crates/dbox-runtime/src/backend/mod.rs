//! Container engine abstraction.
//!
//! The session layer only ever talks to a container engine through the
//! [`ContainerEngine`] capability, so any compliant backend (Podman, or the
//! in-memory engine used by tests) can be substituted.

pub mod memory;
pub mod podman;

use std::fmt;
use std::path::PathBuf;

use dbox_common::config::DboxConfig;
use dbox_common::constants::{IDLE_COMMAND, LABEL_WORKDIR};
use dbox_common::error::Result;
use dbox_common::types::{ContainerRef, ExitStatus, IdentityMapping, MountSpec, Session};

use crate::exec::ExecIo;

/// Everything the engine needs to create a session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Bind mounts.
    pub mounts: Vec<MountSpec>,
    /// User namespace mapping.
    pub identity: IdentityMapping,
    /// Labels attached to the container.
    pub labels: Vec<(String, String)>,
    /// Command the container idles on.
    pub command: Vec<String>,
}

impl CreateSpec {
    /// Builds the create request for a session.
    #[must_use]
    pub fn for_session(session: &Session) -> Self {
        Self {
            name: session.container_name.clone(),
            image: session.image.clone(),
            mounts: session.mounts.clone(),
            identity: session.identity.clone(),
            labels: vec![(
                LABEL_WORKDIR.to_string(),
                session.workdir.display().to_string(),
            )],
            command: IDLE_COMMAND.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Container status as reported by the engine's inspect capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created, never started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Exited or stopped.
    Exited,
    /// A status this crate does not know about.
    Unknown(String),
}

impl ContainerStatus {
    /// Maps an engine status string such as `running` or `exited`.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" | "stopped" | "stopping" => Self::Exited,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// A command to execute inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory inside the container.
    pub workdir: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// `uid:gid` to run as.
    pub user: Option<String>,
}

/// Platform-agnostic container engine.
///
/// Operations addressing a container that does not exist fail with
/// `DboxError::ContainerNotFound`, except [`ContainerEngine::inspect`] which
/// reports it as `Ok(None)`.
pub trait ContainerEngine: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Creates a container without starting it.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::ImageNotFound` if the image is not available
    /// locally, `DboxError::NameConflict` if the name is taken, and
    /// `DboxError::EngineTransient` when the engine is busy.
    fn create(&self, spec: &CreateSpec) -> Result<ContainerRef>;

    /// Starts a created or stopped container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    fn start(&self, id: &ContainerRef) -> Result<()>;

    /// Stops a running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    fn stop(&self, id: &ContainerRef) -> Result<()>;

    /// Removes a container, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be removed.
    fn remove(&self, id: &ContainerRef) -> Result<()>;

    /// Reports the container's status, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    fn inspect(&self, id: &ContainerRef) -> Result<Option<ContainerStatus>>;

    /// Executes a command in a running container, streaming its stdio
    /// through `io`, and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be launched. A non-zero
    /// exit of the command itself is reported through the returned status.
    fn exec(&self, id: &ContainerRef, request: &ExecRequest, io: ExecIo) -> Result<ExitStatus>;
}

/// Creates the Podman backend configured for this host.
///
/// # Errors
///
/// Returns an error if the engine binary cannot be located.
pub fn detect_engine(config: &DboxConfig) -> Result<podman::PodmanEngine> {
    podman::PodmanEngine::locate(&config.engine_binary)
}
