//! Persistent session state.
//!
//! Keeps one JSON record per working directory, enabling daemon-less
//! lifecycle management across independent invocations. Records are
//! replaced atomically; the store itself does no locking, so callers must
//! hold the session lock while using it.

use std::io::Write;
use std::path::{Path, PathBuf};

use dbox_common::config::DboxConfig;
use dbox_common::error::{DboxError, Result};
use dbox_common::types::{Session, SessionKey};

/// Directory of session records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Opens the store rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Opens the store configured for this host.
    #[must_use]
    pub fn from_config(config: &DboxConfig) -> Self {
        Self::new(config.sessions_dir())
    }

    /// Returns the record path for a working directory.
    #[must_use]
    pub fn record_path(&self, workdir: &Path) -> PathBuf {
        self.dir
            .join(format!("{}.json", SessionKey::for_workdir(workdir)))
    }

    /// Loads the session bound to `workdir`, if one was ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub fn load(&self, workdir: &Path) -> Result<Option<Session>> {
        let path = self.record_path(workdir);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DboxError::io(path, e)),
        };
        let session: Session = serde_json::from_str(&content)?;
        if session.workdir != workdir {
            return Err(DboxError::Config {
                message: format!(
                    "session record {} belongs to {}, not {}",
                    path.display(),
                    session.workdir.display(),
                    workdir.display()
                ),
            });
        }
        tracing::debug!(path = %path.display(), state = %session.state, "loaded session");
        Ok(Some(session))
    }

    /// Persists the full record, replacing any previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DboxError::io(&self.dir, e))?;
        let path = self.record_path(&session.workdir);

        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| DboxError::io(&self.dir, e))?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), session)?;
        tmp.as_file_mut()
            .write_all(b"\n")
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| DboxError::io(tmp.path(), e))?;
        let _ = tmp
            .persist(&path)
            .map_err(|e| DboxError::io(&path, e.error))?;

        tracing::debug!(path = %path.display(), state = %session.state, "saved session");
        Ok(())
    }

    /// Removes the record for `workdir`. Removing a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be removed.
    pub fn delete(&self, workdir: &Path) -> Result<()> {
        let path = self.record_path(workdir);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "deleted session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DboxError::io(path, e)),
        }
    }

    /// Lists every stored session, ordered by working directory.
    ///
    /// Records that cannot be parsed are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be read.
    pub fn list(&self) -> Result<Vec<Session>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DboxError::io(&self.dir, e)),
        };
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| DboxError::io(&self.dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| DboxError::io(&path, e))
                .and_then(|content| Ok(serde_json::from_str::<Session>(&content)?));
            match parsed {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable session record"
                ),
            }
        }
        sessions.sort_by(|a, b| a.workdir.cmp(&b.workdir));
        Ok(sessions)
    }

    /// Root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbox_common::types::{
        ContainerRef, IdMapEntry, IdentityMapping, MountMode, MountSpec, SessionState,
        SubordinateRange,
    };

    fn session(workdir: &str) -> Session {
        let range = SubordinateRange { start: 100_000, count: 65_536 };
        let mut s = Session::new(
            PathBuf::from(workdir),
            "fedora:40".into(),
            vec![
                MountSpec::identity(workdir),
                MountSpec {
                    host_path: "/opt/sdk".into(),
                    container_path: "/sdk".into(),
                    mode: MountMode::Ro,
                },
            ],
            IdentityMapping {
                host_uid: 1000,
                host_gid: 1000,
                container_uid: 1000,
                container_gid: 1000,
                subuid: range,
                subgid: range,
                uid_map: vec![IdMapEntry { container_id: 1000, intermediate_id: 0, size: 1 }],
                gid_map: vec![IdMapEntry { container_id: 1000, intermediate_id: 0, size: 1 }],
            },
        );
        s.container_ref = Some(ContainerRef::new("4f2a9c"));
        s.set_state(SessionState::Running);
        s
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions"));
        let saved = session("/proj");

        store.save(&saved).expect("save");
        let loaded = store.load(Path::new("/proj")).expect("load").expect("present");
        assert_eq!(loaded, saved);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        assert!(store.load(Path::new("/proj")).expect("load").is_none());
    }

    #[test]
    fn save_replaces_previous_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let mut s = session("/proj");
        store.save(&s).expect("first save");
        s.set_state(SessionState::Stopped);
        store.save(&s).expect("second save");

        let loaded = store.load(Path::new("/proj")).expect("load").expect("present");
        assert_eq!(loaded.state, SessionState::Stopped);
        let files = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(files, 1, "temporary files must not be left behind");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        store.save(&session("/proj")).expect("save");
        store.delete(Path::new("/proj")).expect("first delete");
        store.delete(Path::new("/proj")).expect("second delete");
        assert!(store.load(Path::new("/proj")).expect("load").is_none());
    }

    #[test]
    fn list_skips_garbage_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        store.save(&session("/b")).expect("save b");
        store.save(&session("/a")).expect("save a");
        std::fs::write(dir.path().join("broken.json"), "{").expect("write garbage");

        let listed: Vec<_> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|s| s.workdir)
            .collect();
        assert_eq!(listed, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn record_for_other_workdir_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let s = session("/proj");
        let content = serde_json::to_string(&s).expect("serialize");
        std::fs::write(store.record_path(Path::new("/elsewhere")), content).expect("write");

        let err = store.load(Path::new("/elsewhere")).unwrap_err();
        assert!(matches!(err, DboxError::Config { .. }));
    }
}
