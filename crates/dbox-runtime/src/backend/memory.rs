//! In-memory container engine.
//!
//! Keeps containers in a process-local table and emulates a handful of
//! commands (`echo`, `true`, `false`, `exit N`, `pwd`). Every call is recorded
//! so callers can assert on exactly which engine operations were issued, and
//! failures can be injected per operation.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use dbox_common::error::{DboxError, Result};
use dbox_common::types::{ContainerRef, ExitStatus};

use super::{ContainerEngine, ContainerStatus, CreateSpec, ExecRequest};
use crate::exec::ExecIo;

/// Engine operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    /// `create`
    Create,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `remove`
    Remove,
    /// `inspect`
    Inspect,
    /// `exec`
    Exec,
}

/// Failure returned by the next matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Engine busy.
    Transient,
    /// Engine rejected the call.
    Fatal,
}

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// A container was requested.
    Create {
        /// Requested name.
        name: String,
        /// Requested image.
        image: String,
    },
    /// `start` was called.
    Start(ContainerRef),
    /// `stop` was called.
    Stop(ContainerRef),
    /// `remove` was called.
    Remove(ContainerRef),
    /// `inspect` was called.
    Inspect(ContainerRef),
    /// A command was executed.
    Exec {
        /// Target container.
        container: ContainerRef,
        /// Executed program.
        command: String,
        /// Program arguments.
        args: Vec<String>,
        /// Working directory inside the container.
        workdir: PathBuf,
    },
}

#[derive(Debug)]
struct MemContainer {
    name: String,
    status: ContainerStatus,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    containers: HashMap<ContainerRef, MemContainer>,
    calls: Vec<EngineCall>,
    failures: Vec<(EngineOp, InjectedFailure)>,
    missing_images: HashSet<String>,
}

impl Inner {
    fn take_failure(&mut self, op: EngineOp) -> Result<()> {
        let Some(pos) = self.failures.iter().position(|(o, _)| *o == op) else {
            return Ok(());
        };
        let (_, failure) = self.failures.remove(pos);
        let operation = op_name(op);
        Err(match failure {
            InjectedFailure::Transient => DboxError::EngineTransient {
                operation,
                message: "injected: engine busy".into(),
            },
            InjectedFailure::Fatal => DboxError::EngineFatal {
                operation,
                message: "injected: engine failure".into(),
            },
        })
    }

    /// Resolves a reference by id or by name, the way podman does.
    fn resolve(&self, id: &ContainerRef) -> Result<ContainerRef> {
        if self.containers.contains_key(id) {
            return Ok(id.clone());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.name == id.as_str())
            .map(|(key, _)| key.clone())
            .ok_or_else(|| DboxError::ContainerNotFound {
                container: id.to_string(),
            })
    }
}

const fn op_name(op: EngineOp) -> &'static str {
    match op {
        EngineOp::Create => "create",
        EngineOp::Start => "start",
        EngineOp::Stop => "stop",
        EngineOp::Remove => "rm",
        EngineOp::Inspect => "inspect",
        EngineOp::Exec => "exec",
    }
}

/// Process-local engine implementation.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    inner: Mutex<Inner>,
}

impl InMemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes the next `times` calls of `op` fail with `failure`.
    pub fn inject_failure(&self, op: EngineOp, failure: InjectedFailure, times: usize) {
        let mut inner = self.lock();
        for _ in 0..times {
            inner.failures.push((op, failure));
        }
    }

    /// Makes `create` report `image` as not available locally.
    pub fn mark_image_missing(&self, image: impl Into<String>) {
        let _ = self.lock().missing_images.insert(image.into());
    }

    /// Deletes a container behind the session manager's back.
    pub fn delete_out_of_band(&self, id: &ContainerRef) -> bool {
        self.lock().containers.remove(id).is_some()
    }

    /// Stops a container behind the session manager's back.
    pub fn stop_out_of_band(&self, id: &ContainerRef) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.status = ContainerStatus::Exited;
        }
    }

    /// Adds a container that the session manager did not create.
    pub fn insert_foreign(&self, name: impl Into<String>, status: ContainerStatus) -> ContainerRef {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ContainerRef::new(format!("mem-{:012x}", inner.next_id));
        let _ = inner.containers.insert(
            id.clone(),
            MemContainer {
                name: name.into(),
                status,
            },
        );
        id
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of `create` calls made so far.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Create { .. }))
            .count()
    }

    /// Number of containers currently known to the engine.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Current status of a container, if it exists.
    #[must_use]
    pub fn status_of(&self, id: &ContainerRef) -> Option<ContainerStatus> {
        self.lock().containers.get(id).map(|c| c.status.clone())
    }
}

impl ContainerEngine for InMemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create(&self, spec: &CreateSpec) -> Result<ContainerRef> {
        let mut inner = self.lock();
        inner.calls.push(EngineCall::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        inner.take_failure(EngineOp::Create)?;
        if inner.missing_images.contains(&spec.image) {
            return Err(DboxError::ImageNotFound {
                image: spec.image.clone(),
            });
        }
        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(DboxError::NameConflict {
                name: spec.name.clone(),
            });
        }
        inner.next_id += 1;
        let id = ContainerRef::new(format!("mem-{:012x}", inner.next_id));
        let _ = inner.containers.insert(
            id.clone(),
            MemContainer {
                name: spec.name.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    fn start(&self, id: &ContainerRef) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(EngineCall::Start(id.clone()));
        inner.take_failure(EngineOp::Start)?;
        let key = inner.resolve(id)?;
        if let Some(c) = inner.containers.get_mut(&key) {
            c.status = ContainerStatus::Running;
        }
        Ok(())
    }

    fn stop(&self, id: &ContainerRef) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(EngineCall::Stop(id.clone()));
        inner.take_failure(EngineOp::Stop)?;
        let key = inner.resolve(id)?;
        if let Some(c) = inner.containers.get_mut(&key) {
            c.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    fn remove(&self, id: &ContainerRef) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(EngineCall::Remove(id.clone()));
        inner.take_failure(EngineOp::Remove)?;
        let key = inner.resolve(id)?;
        let _ = inner.containers.remove(&key);
        Ok(())
    }

    fn inspect(&self, id: &ContainerRef) -> Result<Option<ContainerStatus>> {
        let mut inner = self.lock();
        inner.calls.push(EngineCall::Inspect(id.clone()));
        inner.take_failure(EngineOp::Inspect)?;
        Ok(inner
            .resolve(id)
            .ok()
            .and_then(|key| inner.containers.get(&key))
            .map(|c| c.status.clone()))
    }

    fn exec(&self, id: &ContainerRef, request: &ExecRequest, mut io: ExecIo) -> Result<ExitStatus> {
        {
            let mut inner = self.lock();
            inner.calls.push(EngineCall::Exec {
                container: id.clone(),
                command: request.command.clone(),
                args: request.args.clone(),
                workdir: request.workdir.clone(),
            });
            inner.take_failure(EngineOp::Exec)?;
            let key = inner.resolve(id)?;
            let running = inner
                .containers
                .get(&key)
                .is_some_and(|c| c.status == ContainerStatus::Running);
            if !running {
                return Err(DboxError::EngineFatal {
                    operation: "exec",
                    message: format!("container {id} is not running"),
                });
            }
        }

        let write_err = |e: std::io::Error| DboxError::EngineFatal {
            operation: "exec",
            message: e.to_string(),
        };
        let code = match request.command.as_str() {
            "echo" => {
                writeln!(io.stdout, "{}", request.args.join(" ")).map_err(write_err)?;
                0
            }
            "pwd" => {
                writeln!(io.stdout, "{}", request.workdir.display()).map_err(write_err)?;
                0
            }
            "true" => 0,
            "false" => 1,
            "exit" => request
                .args
                .first()
                .and_then(|a| a.parse().ok())
                .unwrap_or(0),
            other => {
                writeln!(io.stderr, "{other}: command not found").map_err(write_err)?;
                127
            }
        };
        io.stdout.flush().map_err(write_err)?;
        Ok(ExitStatus::from_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbox_common::types::{IdentityMapping, SubordinateRange};

    fn spec(name: &str, image: &str) -> CreateSpec {
        let range = SubordinateRange { start: 100_000, count: 65_536 };
        CreateSpec {
            name: name.into(),
            image: image.into(),
            mounts: Vec::new(),
            identity: IdentityMapping {
                host_uid: 1000,
                host_gid: 1000,
                container_uid: 1000,
                container_gid: 1000,
                subuid: range,
                subgid: range,
                uid_map: Vec::new(),
                gid_map: Vec::new(),
            },
            labels: Vec::new(),
            command: Vec::new(),
        }
    }

    #[test]
    fn lifecycle_transitions_are_tracked() {
        let engine = InMemoryEngine::new();
        let id = engine.create(&spec("dbox-a", "fedora")).expect("create");
        assert_eq!(engine.inspect(&id).expect("inspect"), Some(ContainerStatus::Created));
        engine.start(&id).expect("start");
        assert_eq!(engine.status_of(&id), Some(ContainerStatus::Running));
        engine.stop(&id).expect("stop");
        assert_eq!(engine.status_of(&id), Some(ContainerStatus::Exited));
        engine.remove(&id).expect("remove");
        assert_eq!(engine.inspect(&id).expect("inspect"), None);
    }

    #[test]
    fn duplicate_name_conflicts_and_names_resolve() {
        let engine = InMemoryEngine::new();
        let _ = engine.create(&spec("dbox-a", "fedora")).expect("create");
        let err = engine.create(&spec("dbox-a", "fedora")).unwrap_err();
        assert!(matches!(err, DboxError::NameConflict { .. }));
        engine.remove(&ContainerRef::new("dbox-a")).expect("remove by name");
        assert_eq!(engine.container_count(), 0);
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let engine = InMemoryEngine::new();
        engine.inject_failure(EngineOp::Create, InjectedFailure::Transient, 1);
        assert!(engine.create(&spec("dbox-a", "fedora")).unwrap_err().is_transient());
        assert!(engine.create(&spec("dbox-a", "fedora")).is_ok());
        assert_eq!(engine.create_count(), 2);
    }

    #[test]
    fn missing_image_is_reported() {
        let engine = InMemoryEngine::new();
        engine.mark_image_missing("ghost:latest");
        let err = engine.create(&spec("dbox-a", "ghost:latest")).unwrap_err();
        assert!(matches!(err, DboxError::ImageNotFound { .. }));
    }

    #[test]
    fn missing_container_errors_are_not_found() {
        let engine = InMemoryEngine::new();
        let err = engine.start(&ContainerRef::new("nope")).unwrap_err();
        assert!(matches!(err, DboxError::ContainerNotFound { .. }));
    }
}
