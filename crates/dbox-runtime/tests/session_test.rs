//! Integration tests for session orchestration.
//!
//! Every test drives a real [`SessionManager`] with on-disk records and
//! locks in a temporary data directory, against the in-memory engine:
//! 1. First run, reuse, and recovery from an externally deleted container
//! 2. Identity and mount validation before any engine call
//! 3. Lock discipline (concurrency, stale locks, timeouts, cancellation)
//! 4. Engine failure handling (retries, missing image)
//! 5. Stop, status, list, and remove

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use dbox_common::config::{DboxConfig, RetrySettings};
use dbox_common::error::DboxError;
use dbox_common::types::SessionState;
use dbox_core::namespace::current_identity;
use dbox_runtime::backend::memory::{EngineCall, EngineOp, InMemoryEngine, InjectedFailure};
use dbox_runtime::exec::{CommandExecutor, ExecIo, SignalForwarder};
use dbox_runtime::lock::LockManager;
use dbox_runtime::retry::RetryPolicy;
use dbox_runtime::session::{RunRequest, SessionManager};
use dbox_runtime::state::SessionStore;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn captured_io(signals: &SignalForwarder) -> (ExecIo, Captured, Captured) {
    let out = Captured::default();
    let err = Captured::default();
    let io = ExecIo {
        stdin: None,
        stdout: Box::new(out.clone()),
        stderr: Box::new(err.clone()),
        tty: false,
        signals: signals.clone(),
    };
    (io, out, err)
}

struct Harness {
    dir: tempfile::TempDir,
    config: DboxConfig,
    engine: Arc<InMemoryEngine>,
    workdir: PathBuf,
}

impl Harness {
    fn new() -> Self {
        Self::with_subordinate_ranges(true)
    }

    fn with_subordinate_ranges(allocated: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = dir.path().join("proj");
        std::fs::create_dir_all(workdir.join("src")).expect("create workdir");
        let workdir = workdir.canonicalize().expect("canonical workdir");

        let (uid, _) = current_identity();
        let allocation = if allocated {
            format!("# test allocation\n{uid}:100000:65536\n")
        } else {
            "someone-else:100000:65536\n".to_string()
        };
        let subuid = dir.path().join("subuid");
        let subgid = dir.path().join("subgid");
        std::fs::write(&subuid, &allocation).expect("write subuid");
        std::fs::write(&subgid, &allocation).expect("write subgid");

        let config = DboxConfig {
            data_dir: dir.path().join("data"),
            image: "fedora:40".into(),
            lock_timeout_secs: 5,
            retry: RetrySettings {
                max_attempts: 4,
                initial_delay_ms: 0,
                max_delay_ms: 0,
            },
            subuid_path: subuid,
            subgid_path: subgid,
            ..DboxConfig::default()
        };

        Self {
            dir,
            config,
            engine: Arc::new(InMemoryEngine::new()),
            workdir,
        }
    }

    fn manager(&self) -> SessionManager {
        SessionManager::new(self.config.clone(), self.engine.clone())
    }

    fn store(&self) -> SessionStore {
        SessionStore::from_config(&self.config)
    }

    fn locks(&self) -> LockManager {
        LockManager::from_config(&self.config)
    }

    fn run(&self, request: &RunRequest) -> (Result<i32, DboxError>, String, String) {
        let manager = self.manager();
        let (io, out, err) = captured_io(manager.signals());
        let result = manager.run(request, io).map(|s| s.code());
        (result, out.text(), err.text())
    }

    fn other_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).expect("create dir");
        path.canonicalize().expect("canonical")
    }
}

// ── Run ──────────────────────────────────────────────────────────────

#[test]
fn first_run_creates_starts_and_executes() {
    let h = Harness::new();
    let (result, out, _) = h.run(&RunRequest::new(&h.workdir, "echo").with_args(["hi"]));

    assert_eq!(result.expect("run"), 0);
    assert_eq!(out, "hi\n");
    let calls = h.engine.calls();
    assert!(matches!(
        calls.first(),
        Some(EngineCall::Create { image, .. }) if image == "fedora:40"
    ));
    assert!(calls.iter().any(|c| matches!(c, EngineCall::Start(_))));
    assert!(matches!(
        calls.last(),
        Some(EngineCall::Exec { command, workdir, .. })
            if command == "echo" && *workdir == h.workdir
    ));

    let session = h.store().load(&h.workdir).expect("load").expect("saved");
    assert_eq!(session.state, SessionState::Running);
    assert_eq!(session.mounts[0].host_path, h.workdir);
    assert_eq!(session.mounts[0].container_path, h.workdir);
}

#[test]
fn second_run_reuses_container_and_returns_status() {
    let h = Harness::new();
    let (first, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(first.expect("first run"), 0);

    let (second, _, _) = h.run(&RunRequest::new(&h.workdir, "false"));
    assert_eq!(second.expect("second run"), 1);
    assert_eq!(h.engine.create_count(), 1);
}

#[test]
fn exit_status_and_stderr_pass_through() {
    let h = Harness::new();
    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "exit").with_args(["42"]));
    assert_eq!(result.expect("run"), 42);

    let (result, out, err) = h.run(&RunRequest::new(&h.workdir, "no-such-tool"));
    assert_eq!(result.expect("run"), 127);
    assert!(out.is_empty());
    assert_eq!(err, "no-such-tool: command not found\n");
}

#[test]
fn container_deleted_outside_the_tool_is_recreated() {
    let h = Harness::new();
    let (first, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(first.expect("first run"), 0);
    let old = h
        .store()
        .load(&h.workdir)
        .expect("load")
        .and_then(|s| s.container_ref)
        .expect("container recorded");
    assert!(h.engine.delete_out_of_band(&old));

    let (second, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(second.expect("second run"), 0);
    assert_eq!(h.engine.create_count(), 2);
    let current = h.store().load(&h.workdir).expect("load").expect("saved");
    assert_ne!(current.container_ref, Some(old));
}

#[test]
fn cwd_is_translated_through_mounts() {
    let mut h = Harness::new();
    let sdk = h.other_dir("sdk");
    h.config.mounts = vec![format!("{}:/sdk:ro", sdk.display())];

    let request = RunRequest::new(&h.workdir, "pwd").with_cwd(h.workdir.join("src"));
    let (result, out, _) = h.run(&request);
    assert_eq!(result.expect("run in subdir"), 0);
    assert_eq!(out, format!("{}\n", h.workdir.join("src").display()));

    let (result, out, _) = h.run(&RunRequest::new(&h.workdir, "pwd").with_cwd(&sdk));
    assert_eq!(result.expect("run in sdk"), 0);
    assert_eq!(out, "/sdk\n");
}

#[test]
fn cwd_outside_mounts_is_rejected_before_engine_calls() {
    let h = Harness::new();
    let elsewhere = h.other_dir("elsewhere");
    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true").with_cwd(&elsewhere));

    let err = result.unwrap_err();
    assert!(matches!(err, DboxError::PathNotMounted { .. }));
    assert_eq!(err.exit_code(), 119);
    assert!(h.engine.calls().is_empty());
}

#[test]
fn vanished_container_is_not_recreated_by_exec() {
    let h = Harness::new();
    let (first, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(first.expect("first run"), 0);
    let session = h.store().load(&h.workdir).expect("load").expect("saved");
    let id = session.container_ref.clone().expect("container recorded");
    assert!(h.engine.delete_out_of_band(&id));

    let retry = RetryPolicy::immediate(4);
    let executor = CommandExecutor::new(h.engine.as_ref(), &retry);
    let err = executor
        .exec(&session, &h.workdir, "true", &[], &[], ExecIo::null())
        .unwrap_err();
    assert!(matches!(err, DboxError::SessionVanished { .. }));
    assert_eq!(err.exit_code(), 124);
    assert_eq!(h.engine.create_count(), 1);
}

// ── Validation ───────────────────────────────────────────────────────

#[test]
fn missing_subordinate_ranges_fail_without_engine_calls() {
    let h = Harness::with_subordinate_ranges(false);
    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "echo").with_args(["hi"]));

    let err = result.unwrap_err();
    assert!(matches!(err, DboxError::NoSubordinateRange { kind: "uid", .. }));
    assert_eq!(err.exit_code(), 121);
    assert!(h.engine.calls().is_empty());
    assert!(h.store().load(&h.workdir).expect("load").is_none());
}

#[test]
fn mount_collision_is_rejected_before_engine_calls() {
    let h = Harness::new();
    let a = h.other_dir("a");
    let b = h.other_dir("b");
    let request = RunRequest::new(&h.workdir, "true")
        .with_mount(format!("{}:/data", a.display()))
        .with_mount(format!("{}:/data", b.display()));

    let (result, _, _) = h.run(&request);
    assert!(matches!(result.unwrap_err(), DboxError::InvalidMount { .. }));
    assert!(h.engine.calls().is_empty());
}

#[test]
fn missing_host_path_is_rejected_before_engine_calls() {
    let h = Harness::new();
    let request = RunRequest::new(&h.workdir, "true").with_mount("/definitely/not/here:/x");

    let (result, _, _) = h.run(&request);
    assert!(matches!(result.unwrap_err(), DboxError::InvalidMount { .. }));
    assert!(h.engine.calls().is_empty());
}

#[test]
fn changed_host_identity_is_a_configuration_error() {
    let h = Harness::new();
    let (first, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(first.expect("first run"), 0);

    let store = h.store();
    let mut session = store.load(&h.workdir).expect("load").expect("saved");
    session.identity.host_uid = session.identity.host_uid.wrapping_add(1);
    store.save(&session).expect("save");

    let (second, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    let err = second.unwrap_err();
    assert!(matches!(err, DboxError::IdentityChanged { .. }));
    assert_eq!(err.exit_code(), 121);
    assert_eq!(h.engine.create_count(), 1);
}

// ── Locking ──────────────────────────────────────────────────────────

#[test]
fn concurrent_runs_create_exactly_one_container() {
    let h = Harness::new();
    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let manager = h.manager();
            let barrier = Arc::clone(&barrier);
            let request = RunRequest::new(&h.workdir, "true");
            std::thread::spawn(move || {
                barrier.wait();
                manager.run(&request, ExecIo::null()).map(|s| s.code())
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().expect("worker").expect("run"), 0);
    }
    assert_eq!(h.engine.create_count(), 1);
    assert_eq!(h.engine.container_count(), 1);
}

#[test]
fn stale_lock_of_dead_process_is_reclaimed() {
    let h = Harness::new();
    let lock_path = h.locks().lock_path(&h.workdir);
    std::fs::create_dir_all(lock_path.parent().expect("lock dir")).expect("create lock dir");
    std::fs::write(
        &lock_path,
        concat!(
            r#"{"pid":999999999,"token":"6f1c1e0a-58a4-4a59-9d62-1f0a4b0f0d11","#,
            r#""acquired_at":"2024-01-01T00:00:00Z"}"#
        ),
    )
    .expect("write stale lock");

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(result.expect("run"), 0);
    assert!(!lock_path.exists(), "lock must be released after the run");
}

#[test]
fn held_lock_times_out() {
    let mut h = Harness::new();
    h.config.lock_timeout_secs = 1;
    let _held = h
        .locks()
        .try_acquire(&h.workdir)
        .expect("try")
        .expect("free");

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    let err = result.unwrap_err();
    assert!(matches!(err, DboxError::LockTimeout { .. }));
    assert_eq!(err.exit_code(), 123);
    assert!(h.engine.calls().is_empty());
}

#[test]
fn cancelled_run_releases_lock() {
    let h = Harness::new();
    let manager = h.manager();
    manager.signals().interrupt();

    let err = manager
        .run(&RunRequest::new(&h.workdir, "true"), ExecIo::null())
        .unwrap_err();
    assert!(matches!(err, DboxError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert!(h.engine.calls().is_empty());
    assert!(h.locks().try_acquire(&h.workdir).expect("try").is_some());
}

#[test]
fn interrupt_while_waiting_for_lock_cancels_promptly() {
    let mut h = Harness::new();
    h.config.lock_timeout_secs = 30;
    let _held = h
        .locks()
        .try_acquire(&h.workdir)
        .expect("try")
        .expect("free");
    let manager = h.manager();
    let signals = manager.signals().clone();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        signals.interrupt();
    });

    let start = Instant::now();
    let err = manager
        .run(&RunRequest::new(&h.workdir, "true"), ExecIo::null())
        .unwrap_err();
    interrupter.join().expect("interrupter");
    assert!(matches!(err, DboxError::Cancelled), "got {err}");
    assert_eq!(err.exit_code(), 130);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(h.engine.calls().is_empty());
}

#[test]
fn failed_run_releases_lock() {
    let h = Harness::new();
    h.engine.mark_image_missing("fedora:40");
    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert!(result.is_err());
    assert!(h.locks().try_acquire(&h.workdir).expect("try").is_some());
}

// ── Engine failures ──────────────────────────────────────────────────

#[test]
fn transient_failures_below_limit_are_retried() {
    let h = Harness::new();
    h.engine
        .inject_failure(EngineOp::Create, InjectedFailure::Transient, 3);

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(result.expect("run"), 0);
    assert_eq!(h.engine.create_count(), 4);
}

#[test]
fn transient_failures_above_limit_escalate() {
    let h = Harness::new();
    h.engine
        .inject_failure(EngineOp::Start, InjectedFailure::Transient, 4);

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    let err = result.unwrap_err();
    assert!(matches!(err, DboxError::EngineFatal { operation: "start", .. }));
    assert_eq!(err.exit_code(), 122);
}

#[test]
fn transient_inspect_before_exec_is_retried() {
    let h = Harness::new();
    h.engine
        .inject_failure(EngineOp::Inspect, InjectedFailure::Transient, 1);

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(result.expect("run"), 0);
    assert_eq!(h.engine.create_count(), 1);
}

#[test]
fn missing_image_fails_once_without_retry() {
    let h = Harness::new();
    h.engine.mark_image_missing("ghost:latest");

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true").with_image("ghost:latest"));
    assert!(matches!(result.unwrap_err(), DboxError::ImageNotFound { .. }));
    assert_eq!(h.engine.create_count(), 1);
}

// ── Stop, status, list, remove ───────────────────────────────────────

#[test]
fn stop_then_status_then_run_again() {
    let h = Harness::new();
    let (first, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(first.expect("first run"), 0);

    let manager = h.manager();
    let stopped = manager.stop(&h.workdir).expect("stop");
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(
        manager.status(&h.workdir).expect("status").state,
        SessionState::Stopped
    );

    let (again, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(again.expect("run after stop"), 0);
    assert_eq!(h.engine.create_count(), 1);
}

#[test]
fn stop_without_session_reports_not_found() {
    let h = Harness::new();
    let err = h.manager().stop(&h.workdir).unwrap_err();
    assert!(matches!(err, DboxError::SessionNotFound { .. }));
}

#[test]
fn list_reports_live_state() {
    let h = Harness::new();
    let second = h.other_dir("second");
    let (a, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    let (b, _, _) = h.run(&RunRequest::new(&second, "true"));
    assert_eq!(a.expect("run a"), 0);
    assert_eq!(b.expect("run b"), 0);

    let id = h
        .store()
        .load(&second)
        .expect("load")
        .and_then(|s| s.container_ref)
        .expect("container recorded");
    h.engine.stop_out_of_band(&id);

    let listed = h.manager().list().expect("list");
    assert_eq!(listed.len(), 2);
    let state_of = |path: &Path| {
        listed
            .iter()
            .find(|s| s.workdir == path)
            .map(|s| s.state)
            .expect("listed")
    };
    assert_eq!(state_of(&h.workdir), SessionState::Running);
    assert_eq!(state_of(&second), SessionState::Stopped);
}

#[test]
fn remove_twice_is_a_no_op() {
    let h = Harness::new();
    let (first, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    assert_eq!(first.expect("first run"), 0);

    let manager = h.manager();
    let removed = manager.remove(&h.workdir).expect("remove");
    assert_eq!(removed.map(|s| s.state), Some(SessionState::Removed));
    assert_eq!(h.engine.container_count(), 0);
    assert!(h.store().load(&h.workdir).expect("load").is_none());

    assert!(manager.remove(&h.workdir).expect("remove again").is_none());
    assert_eq!(h.engine.container_count(), 0);
}

#[test]
fn lock_wait_does_not_block_forever_on_slow_holder() {
    let h = Harness::new();
    let held = h
        .locks()
        .try_acquire(&h.workdir)
        .expect("try")
        .expect("free");
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        held.release().expect("release");
    });

    let (result, _, _) = h.run(&RunRequest::new(&h.workdir, "true"));
    releaser.join().expect("releaser");
    assert_eq!(result.expect("run after wait"), 0);
}
