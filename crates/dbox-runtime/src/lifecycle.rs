//! Session container lifecycle.
//!
//! Drives a [`Session`] through `absent → created → running → stopped →
//! removed` against a [`ContainerEngine`], persisting every transition. Each
//! operation reconciles with what the engine actually reports first, so a
//! previous invocation that crashed half-way, or a container removed outside
//! the tool, is recovered from rather than reported.

use dbox_common::error::{DboxError, Result};
use dbox_common::types::{ContainerRef, Session, SessionState};
use dbox_core::filesystem::mount::validate_mounts;
use dbox_core::namespace::validate_mapping;

use crate::backend::{ContainerEngine, ContainerStatus, CreateSpec};
use crate::retry::RetryPolicy;
use crate::state::SessionStore;

/// Applies lifecycle transitions to sessions.
///
/// Callers must hold the session lock for every mutating operation.
pub struct LifecycleController<'a> {
    engine: &'a dyn ContainerEngine,
    store: &'a SessionStore,
    retry: &'a RetryPolicy,
}

impl<'a> LifecycleController<'a> {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        engine: &'a dyn ContainerEngine,
        store: &'a SessionStore,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            engine,
            store,
            retry,
        }
    }

    /// Brings the session's container to the running state, creating or
    /// recreating it as needed.
    ///
    /// Calling this on a session that is already running only inspects it.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::InvalidMount` or `DboxError::MalformedIdentity`
    /// before any container is created, `DboxError::ImageNotFound` if the
    /// image is missing, or an engine error once retries are exhausted.
    pub fn ensure_running(&self, session: &mut Session) -> Result<()> {
        let Some(id) = session.container_ref.clone() else {
            self.create(session)?;
            return self.start(session);
        };

        match self.inspect(&id)? {
            None => {
                tracing::warn!(
                    id = %id,
                    workdir = %session.workdir.display(),
                    "session container is gone, recreating"
                );
                self.reset(session)?;
                self.create(session)?;
                self.start(session)
            }
            Some(ContainerStatus::Running) => {
                if session.state != SessionState::Running {
                    session.set_state(SessionState::Running);
                    self.store.save(session)?;
                }
                tracing::debug!(id = %id, "session container already running");
                Ok(())
            }
            Some(status) => {
                tracing::debug!(id = %id, %status, "starting session container");
                self.start(session)
            }
        }
    }

    /// Stops the session's container. Stopping a stopped session is a no-op.
    ///
    /// A container that no longer exists resets the session to `absent`.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the container cannot be stopped.
    pub fn stop(&self, session: &mut Session) -> Result<()> {
        let Some(id) = session.container_ref.clone() else {
            tracing::debug!(workdir = %session.workdir.display(), "no container to stop");
            return Ok(());
        };
        match self.retry.run("stop", || self.engine.stop(&id)) {
            Ok(()) => {
                tracing::info!(id = %id, "stopped session container");
                session.set_state(SessionState::Stopped);
                self.store.save(session)
            }
            Err(DboxError::ContainerNotFound { .. }) => {
                tracing::warn!(id = %id, "session container is gone");
                self.reset(session)
            }
            Err(e) => Err(e),
        }
    }

    /// Force-removes the session's container and deletes its record.
    ///
    /// A missing container or record is not an error, so removing twice is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the container exists but cannot be removed,
    /// or an I/O error if the record cannot be deleted.
    pub fn remove(&self, session: &mut Session) -> Result<()> {
        let target = session
            .container_ref
            .clone()
            .unwrap_or_else(|| ContainerRef::new(session.container_name.clone()));
        let _ = self.discard(&target)?;
        self.store.delete(&session.workdir)?;
        session.container_ref = None;
        session.set_state(SessionState::Removed);
        Ok(())
    }

    /// Force-removes a container by id or name, whether or not a session
    /// record refers to it. Returns whether a container was removed.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the container exists but cannot be removed.
    pub fn discard(&self, id: &ContainerRef) -> Result<bool> {
        match self.retry.run("rm", || self.engine.remove(id)) {
            Ok(()) => {
                tracing::info!(id = %id, "removed session container");
                Ok(true)
            }
            Err(DboxError::ContainerNotFound { .. }) => {
                tracing::debug!(id = %id, "container already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Reports the state the engine currently puts the session in, without
    /// changing anything.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the container cannot be inspected.
    pub fn observe(&self, session: &Session) -> Result<SessionState> {
        let Some(id) = &session.container_ref else {
            return Ok(SessionState::Absent);
        };
        Ok(match self.inspect(id)? {
            None => SessionState::Absent,
            Some(ContainerStatus::Running) => SessionState::Running,
            Some(ContainerStatus::Created) => SessionState::Created,
            Some(
                ContainerStatus::Exited | ContainerStatus::Paused | ContainerStatus::Unknown(_),
            ) => SessionState::Stopped,
        })
    }

    /// Reconciles the recorded state with the engine and persists any change.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the container cannot be inspected.
    pub fn refresh(&self, session: &mut Session) -> Result<SessionState> {
        let observed = self.observe(session)?;
        if observed != session.state {
            tracing::info!(
                workdir = %session.workdir.display(),
                recorded = %session.state,
                %observed,
                "session state drifted"
            );
            if observed == SessionState::Absent {
                session.container_ref = None;
            }
            session.set_state(observed);
            self.store.save(session)?;
        }
        Ok(observed)
    }

    fn inspect(&self, id: &ContainerRef) -> Result<Option<ContainerStatus>> {
        self.retry.run("inspect", || self.engine.inspect(id))
    }

    fn reset(&self, session: &mut Session) -> Result<()> {
        session.container_ref = None;
        session.set_state(SessionState::Absent);
        self.store.save(session)
    }

    fn create(&self, session: &mut Session) -> Result<()> {
        validate_mounts(&session.mounts)?;
        validate_mapping(&session.identity)?;

        let spec = CreateSpec::for_session(session);
        let id = match self.retry.run("create", || self.engine.create(&spec)) {
            Ok(id) => id,
            Err(DboxError::NameConflict { name }) => {
                // Left behind by an invocation that died before saving the record.
                tracing::warn!(name = %name, "removing orphaned session container");
                let _ = self.discard(&ContainerRef::new(name))?;
                self.retry.run("create", || self.engine.create(&spec))?
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            id = %id,
            name = %spec.name,
            image = %spec.image,
            workdir = %session.workdir.display(),
            "created session container"
        );
        session.container_ref = Some(id);
        session.set_state(SessionState::Created);
        self.store.save(session)
    }

    fn start(&self, session: &mut Session) -> Result<()> {
        if session.container_ref.is_none() {
            self.create(session)?;
        }
        match self.start_recorded(session) {
            Err(DboxError::ContainerNotFound { .. }) => {
                tracing::warn!(
                    workdir = %session.workdir.display(),
                    "session container vanished before start, recreating"
                );
                self.reset(session)?;
                self.create(session)?;
                self.start_recorded(session)
            }
            other => other,
        }
    }

    fn start_recorded(&self, session: &mut Session) -> Result<()> {
        let id = session
            .container_ref
            .clone()
            .ok_or_else(|| DboxError::SessionVanished {
                container: session.container_name.clone(),
            })?;
        self.retry.run("start", || self.engine.start(&id))?;
        tracing::info!(id = %id, "started session container");
        session.set_state(SessionState::Running);
        self.store.save(session)
    }
}
