//! Rootless Podman backend.
//!
//! Drives the `podman` CLI. Engine diagnostics on stderr are classified into
//! the workspace error taxonomy so the lifecycle controller can tell a busy
//! engine from a missing image or a missing container.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use dbox_common::error::{DboxError, Result};
use dbox_common::types::{ContainerRef, ExitStatus};

use super::{ContainerEngine, ContainerStatus, CreateSpec, ExecRequest};
use crate::exec::{self, ExecIo};

/// Seconds `podman stop` waits before killing the idle process.
const STOP_TIMEOUT_SECS: u32 = 5;

/// Stderr fragments meaning the addressed container does not exist.
const NOT_FOUND_MARKERS: &[&str] = &["no such container", "no container with name or id"];

/// Stderr fragments meaning the image is not available locally.
const IMAGE_MISSING_MARKERS: &[&str] = &[
    "image not known",
    "no such image",
    "manifest unknown",
    "unable to find image",
];

/// Stderr fragments meaning the engine is busy and the call may be retried.
const TRANSIENT_MARKERS: &[&str] = &[
    "database is locked",
    "resource temporarily unavailable",
    "device or resource busy",
    "timed out",
    "try again",
    "connection refused",
    "cannot connect",
];

/// Backend that shells out to a `podman` binary.
#[derive(Debug, Clone)]
pub struct PodmanEngine {
    binary: PathBuf,
}

impl PodmanEngine {
    /// Creates a backend using the given binary path.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Locates `name` on `PATH` (or uses it directly if it is a path).
    ///
    /// # Errors
    ///
    /// Returns `DboxError::EngineFatal` if the binary cannot be found.
    pub fn locate(name: &str) -> Result<Self> {
        let binary = which::which(name).map_err(|e| DboxError::EngineFatal {
            operation: "locate",
            message: format!("{name}: {e}"),
        })?;
        tracing::debug!(binary = %binary.display(), "using podman backend");
        Ok(Self::new(binary))
    }

    /// Path of the engine binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs a podman subcommand to completion and returns its trimmed stdout.
    fn run(&self, operation: &'static str, args: &[String]) -> Result<String> {
        tracing::debug!(operation, ?args, "podman");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(operation, &e))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify(operation, stderr.trim(), args))
    }
}

impl ContainerEngine for PodmanEngine {
    fn name(&self) -> &'static str {
        "podman"
    }

    fn create(&self, spec: &CreateSpec) -> Result<ContainerRef> {
        let id = self.run("create", &create_args(spec))?;
        if id.is_empty() {
            return Err(DboxError::EngineFatal {
                operation: "create",
                message: "engine returned no container id".into(),
            });
        }
        tracing::info!(id = %id, name = %spec.name, image = %spec.image, "container created");
        Ok(ContainerRef::new(id))
    }

    fn start(&self, id: &ContainerRef) -> Result<()> {
        match self.run("start", &["start".into(), id.to_string()]) {
            Err(DboxError::EngineFatal { message, .. })
                if message.to_ascii_lowercase().contains("paused") =>
            {
                tracing::debug!(id = %id, "container is paused, unpausing");
                let _ = self.run("unpause", &["unpause".into(), id.to_string()])?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    fn stop(&self, id: &ContainerRef) -> Result<()> {
        let _ = self.run(
            "stop",
            &[
                "stop".into(),
                "--time".into(),
                STOP_TIMEOUT_SECS.to_string(),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, id: &ContainerRef) -> Result<()> {
        let _ = self.run("rm", &["rm".into(), "--force".into(), id.to_string()])?;
        Ok(())
    }

    fn inspect(&self, id: &ContainerRef) -> Result<Option<ContainerStatus>> {
        let args = [
            "container".to_string(),
            "inspect".into(),
            "--format".into(),
            "{{.State.Status}}".into(),
            id.to_string(),
        ];
        match self.run("inspect", &args) {
            Ok(status) => Ok(Some(ContainerStatus::parse(&status))),
            Err(DboxError::ContainerNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn exec(&self, id: &ContainerRef, request: &ExecRequest, io: ExecIo) -> Result<ExitStatus> {
        let args = exec_args(id, request, io.stdin.is_some(), io.tty);
        let mut cmd = Command::new(&self.binary);
        let _ = cmd.args(&args);
        if io.tty {
            let _ = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            let _ = cmd
                .stdin(if io.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error("exec", &e))?;
        let signals = io.signals.clone();
        // A terminal delivers ^C to the whole foreground group already.
        if !io.tty {
            signals.register(child.id());
        }
        let waited = if io.tty {
            child.wait().map(ExitStatus::from)
        } else {
            exec::relay_child(&mut child, io)
        };
        signals.clear();
        waited.map_err(|e| DboxError::EngineFatal {
            operation: "exec",
            message: e.to_string(),
        })
    }
}

/// Builds the `podman create` argument list for a session container.
pub fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".into(),
        spec.name.clone(),
        "--pull=never".into(),
        "--security-opt".into(),
        "label=disable".into(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    for entry in &spec.identity.uid_map {
        args.push("--uidmap".into());
        args.push(entry.to_string());
    }
    for entry in &spec.identity.gid_map {
        args.push("--gidmap".into());
        args.push(entry.to_string());
    }
    for mount in &spec.mounts {
        args.push("--volume".into());
        args.push(mount.to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Builds the `podman exec` argument list.
pub fn exec_args(
    id: &ContainerRef,
    request: &ExecRequest,
    interactive: bool,
    tty: bool,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if interactive {
        args.push("--interactive".into());
    }
    if tty {
        args.push("--tty".into());
    }
    args.push("--workdir".into());
    args.push(request.workdir.display().to_string());
    if let Some(ref user) = request.user {
        args.push("--user".into());
        args.push(user.clone());
    }
    for (key, value) in &request.env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    args.push(id.to_string());
    args.push(request.command.clone());
    args.extend(request.args.iter().cloned());
    args
}

fn spawn_error(operation: &'static str, e: &std::io::Error) -> DboxError {
    match e.kind() {
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
            DboxError::EngineTransient {
                operation,
                message: e.to_string(),
            }
        }
        _ => DboxError::EngineFatal {
            operation,
            message: format!("cannot run engine: {e}"),
        },
    }
}

/// Maps podman's stderr to an error variant.
fn classify(operation: &'static str, stderr: &str, args: &[String]) -> DboxError {
    let lower = stderr.to_ascii_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(NOT_FOUND_MARKERS) {
        return DboxError::ContainerNotFound {
            container: args.last().cloned().unwrap_or_default(),
        };
    }
    if operation == "create" && has(IMAGE_MISSING_MARKERS) {
        return DboxError::ImageNotFound {
            image: image_arg(args).unwrap_or_default(),
        };
    }
    if operation == "create" && lower.contains("already in use") {
        return DboxError::NameConflict {
            name: flag_value(args, "--name").unwrap_or_default(),
        };
    }
    if has(TRANSIENT_MARKERS) {
        return DboxError::EngineTransient {
            operation,
            message: stderr.to_string(),
        };
    }
    DboxError::EngineFatal {
        operation,
        message: stderr.to_string(),
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// The image is the first positional argument after the create flags.
fn image_arg(args: &[String]) -> Option<String> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg.starts_with("--") {
            if !arg.contains('=') {
                let _ = iter.next();
            }
            continue;
        }
        return Some(arg.clone());
    }
    None
}
