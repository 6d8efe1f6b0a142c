//! Session orchestration.
//!
//! [`SessionManager`] is the single entry point of every invocation. It
//! resolves the session of a working directory, serializes lifecycle changes
//! through the session lock, and hands command execution to the
//! [`CommandExecutor`] once the lock has been released.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dbox_common::config::DboxConfig;
use dbox_common::error::{DboxError, Result};
use dbox_common::types::{ContainerRef, ExitStatus, Session, SessionKey};
use dbox_core::filesystem::mount::{container_path_for, session_mounts};
use dbox_core::namespace::{IdentityResolver, current_identity};

use crate::backend::ContainerEngine;
use crate::exec::{CommandExecutor, ExecIo, SignalForwarder};
use crate::lifecycle::LifecycleController;
use crate::lock::{LockHandle, LockManager};
use crate::retry::RetryPolicy;
use crate::state::SessionStore;

/// A command to run in the session of a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Directory that identifies the session.
    pub workdir: PathBuf,
    /// Host directory the command runs in; must be under a session mount.
    pub cwd: PathBuf,
    /// Program to run.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Environment overrides, applied after the configured ones.
    pub env: Vec<(String, String)>,
    /// Image for a new session; ignored when the session already exists.
    pub image: Option<String>,
    /// Extra mount specs for a new session.
    pub mounts: Vec<String>,
}

impl RunRequest {
    /// Runs `command` in `workdir`'s session, from `workdir` itself.
    pub fn new(workdir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        let workdir = workdir.into();
        Self {
            cwd: workdir.clone(),
            workdir,
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            image: None,
            mounts: Vec::new(),
        }
    }

    /// Sets the program arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the host directory the command runs in.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the image used if the session has to be created.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds a mount spec used if the session has to be created.
    #[must_use]
    pub fn with_mount(mut self, spec: impl Into<String>) -> Self {
        self.mounts.push(spec.into());
        self
    }
}

/// Orchestrates sessions for one invocation.
pub struct SessionManager {
    config: DboxConfig,
    engine: Arc<dyn ContainerEngine>,
    store: SessionStore,
    locks: LockManager,
    resolver: IdentityResolver,
    retry: RetryPolicy,
    signals: SignalForwarder,
}

impl SessionManager {
    /// Creates a manager for the given configuration and engine.
    #[must_use]
    pub fn new(config: DboxConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            store: SessionStore::from_config(&config),
            locks: LockManager::from_config(&config),
            resolver: IdentityResolver::from_config(&config),
            retry: RetryPolicy::from(&config.retry),
            signals: SignalForwarder::new(),
            engine,
            config,
        }
    }

    /// Interrupt handle shared with signal handlers and [`ExecIo`].
    #[must_use]
    pub const fn signals(&self) -> &SignalForwarder {
        &self.signals
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DboxConfig {
        &self.config
    }

    fn lifecycle(&self) -> LifecycleController<'_> {
        LifecycleController::new(self.engine.as_ref(), &self.store, &self.retry)
    }

    fn lock(&self, workdir: &Path) -> Result<LockHandle> {
        self.locks
            .acquire_unless(workdir, self.config.lock_timeout(), || {
                self.signals.is_cancelled()
            })
    }

    /// Runs a command in the session of `request.workdir`, creating and
    /// starting the session container first if necessary.
    ///
    /// The returned status is the command's own exit status.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the identity or mounts are unusable,
    /// `DboxError::LockTimeout` if another invocation holds the session too
    /// long, `DboxError::PathNotMounted` if `request.cwd` is outside the
    /// session mounts, `DboxError::SessionVanished` if the container
    /// disappears before the command starts, `DboxError::Cancelled` if
    /// interrupted before that (including while waiting for the lock), or an
    /// engine error.
    pub fn run(&self, request: &RunRequest, io: ExecIo) -> Result<ExitStatus> {
        let workdir = canonical(&request.workdir)?;
        let cwd = canonical(&request.cwd)?;

        let lock = self.lock(&workdir)?;
        self.check_cancelled()?;
        let mut session = self.load_or_create(&workdir, request)?;
        if container_path_for(&session.mounts, &cwd).is_none() {
            return Err(DboxError::PathNotMounted { path: cwd });
        }
        self.lifecycle().ensure_running(&mut session)?;
        lock.release()?;
        self.check_cancelled()?;

        let mut env = self.config.env.clone();
        env.extend(request.env.iter().cloned());
        CommandExecutor::new(self.engine.as_ref(), &self.retry).exec(
            &session,
            &cwd,
            &request.command,
            &request.args,
            &env,
            io,
        )
    }

    /// Stops the session of `workdir`.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::SessionNotFound` if there is no session, or an
    /// engine error.
    pub fn stop(&self, workdir: &Path) -> Result<Session> {
        let workdir = canonical_or_given(workdir)?;
        let _lock = self.lock(&workdir)?;
        let mut session = self.require(&workdir)?;
        self.lifecycle().stop(&mut session)?;
        Ok(session)
    }

    /// Removes the session of `workdir` and its container.
    ///
    /// Without a record, a container left over under the session's name is
    /// still removed. Returns the removed session, if there was one.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the container cannot be removed.
    pub fn remove(&self, workdir: &Path) -> Result<Option<Session>> {
        let workdir = canonical_or_given(workdir)?;
        let _lock = self.lock(&workdir)?;
        let lifecycle = self.lifecycle();
        match self.store.load(&workdir)? {
            Some(mut session) => {
                lifecycle.remove(&mut session)?;
                Ok(Some(session))
            }
            None => {
                let name = SessionKey::for_workdir(&workdir).container_name();
                if lifecycle.discard(&ContainerRef::new(name))? {
                    tracing::info!(
                        workdir = %workdir.display(),
                        "removed container without a session record"
                    );
                }
                Ok(None)
            }
        }
    }

    /// Returns the session of `workdir`, reconciled with the engine.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::SessionNotFound` if there is no session, or an
    /// engine error.
    pub fn status(&self, workdir: &Path) -> Result<Session> {
        let workdir = canonical_or_given(workdir)?;
        let _lock = self.lock(&workdir)?;
        let mut session = self.require(&workdir)?;
        let _ = self.lifecycle().refresh(&mut session)?;
        Ok(session)
    }

    /// Lists every session with the state the engine currently reports.
    ///
    /// Records are not locked or rewritten; a session whose container cannot
    /// be inspected is listed with its recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store cannot be read.
    pub fn list(&self) -> Result<Vec<Session>> {
        let lifecycle = self.lifecycle();
        let mut sessions = self.store.list()?;
        for session in &mut sessions {
            match lifecycle.observe(session) {
                Ok(state) => session.state = state,
                Err(e) => {
                    tracing::warn!(
                        workdir = %session.workdir.display(),
                        error = %e,
                        "could not inspect session container"
                    );
                }
            }
        }
        Ok(sessions)
    }

    fn load_or_create(&self, workdir: &Path, request: &RunRequest) -> Result<Session> {
        let (host_uid, host_gid) = current_identity();
        if let Some(session) = self.store.load(workdir)? {
            let recorded = &session.identity;
            if (recorded.host_uid, recorded.host_gid) != (host_uid, host_gid) {
                return Err(DboxError::IdentityChanged {
                    workdir: workdir.to_path_buf(),
                    recorded_uid: recorded.host_uid,
                    recorded_gid: recorded.host_gid,
                    host_uid,
                    host_gid,
                });
            }
            if request.image.as_ref().is_some_and(|image| *image != session.image) {
                tracing::warn!(
                    image = %session.image,
                    "session already exists, keeping its image; remove it to change images"
                );
            }
            if !request.mounts.is_empty() {
                tracing::warn!(
                    "session already exists, ignoring extra mounts; remove it to change mounts"
                );
            }
            return Ok(session);
        }

        let identity = self.resolver.resolve(host_uid, host_gid)?;
        let mut extra = self.config.mounts.clone();
        extra.extend(request.mounts.iter().cloned());
        let mounts = session_mounts(workdir, &extra)?;
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.image.clone());
        tracing::info!(workdir = %workdir.display(), image = %image, "new session");
        Ok(Session::new(workdir.to_path_buf(), image, mounts, identity))
    }

    fn require(&self, workdir: &Path) -> Result<Session> {
        self.store
            .load(workdir)?
            .ok_or_else(|| DboxError::SessionNotFound {
                workdir: workdir.to_path_buf(),
            })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.signals.is_cancelled() {
            return Err(DboxError::Cancelled);
        }
        Ok(())
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| DboxError::io(path, e))
}

/// Canonicalizes `path`, falling back to it as given when it no longer
/// exists so sessions of deleted directories can still be managed.
fn canonical_or_given(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(path) => Ok(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && path.is_absolute() => {
            Ok(path.to_path_buf())
        }
        Err(e) => Err(DboxError::io(path, e)),
    }
}
