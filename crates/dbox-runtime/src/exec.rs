//! Command execution inside a running session.
//!
//! The executor maps the host working directory into the container, checks
//! that the container confirmed by the lifecycle controller still exists, and
//! hands the command to the engine. Output of the child is relayed by one
//! thread per stream as soon as it is produced.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::JoinHandle;

use dbox_common::error::{DboxError, Result};
use dbox_common::types::{ExitStatus, Session};
use dbox_core::filesystem::mount::container_path_for;

use crate::backend::{ContainerEngine, ContainerStatus, ExecRequest};
use crate::retry::RetryPolicy;

/// Size of the buffer each relay thread reads into.
const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Shared handle used to interrupt an invocation.
///
/// Signal handlers call [`SignalForwarder::interrupt`]; the orchestrator
/// polls [`SignalForwarder::is_cancelled`] between lifecycle steps, and the
/// engine registers the PID of the process running the command so the
/// interrupt can be forwarded to it.
#[derive(Debug, Clone, Default)]
pub struct SignalForwarder {
    child: Arc<AtomicI32>,
    cancelled: Arc<AtomicBool>,
}

impl SignalForwarder {
    /// Creates a forwarder with no registered child.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the process that should receive forwarded signals.
    pub fn register(&self, pid: u32) {
        self.child
            .store(i32::try_from(pid).unwrap_or(0), Ordering::SeqCst);
    }

    /// Forgets the registered process.
    pub fn clear(&self) {
        self.child.store(0, Ordering::SeqCst);
    }

    /// Marks the invocation as cancelled and forwards `SIGINT` to the
    /// registered child, if any.
    pub fn interrupt(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let pid = self.child.load(Ordering::SeqCst);
        if pid > 0 {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
                tracing::debug!(pid, error = %e, "failed to forward interrupt");
            }
        }
    }

    /// Whether an interrupt has been received.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Standard streams of an execution.
pub struct ExecIo {
    /// Source for the command's stdin; `None` closes it.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Destination for the command's stdout.
    pub stdout: Box<dyn Write + Send>,
    /// Destination for the command's stderr.
    pub stderr: Box<dyn Write + Send>,
    /// Whether the invocation is attached to a terminal.
    pub tty: bool,
    /// Interrupt forwarding handle.
    pub signals: SignalForwarder,
}

impl ExecIo {
    /// Streams wired to the invoking process's own stdio.
    #[must_use]
    pub fn inherit(signals: SignalForwarder) -> Self {
        use std::io::IsTerminal;

        Self {
            tty: io::stdin().is_terminal() && io::stdout().is_terminal(),
            stdin: Some(Box::new(io::stdin())),
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
            signals,
        }
    }

    /// Streams that discard output and provide no input.
    #[must_use]
    pub fn null() -> Self {
        Self {
            stdin: None,
            stdout: Box::new(io::sink()),
            stderr: Box::new(io::sink()),
            tty: false,
            signals: SignalForwarder::new(),
        }
    }
}

impl std::fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecIo")
            .field("stdin", &self.stdin.is_some())
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

/// Copies `reader` into `writer` chunk by chunk, flushing after every chunk.
///
/// Returns the number of bytes relayed.
///
/// # Errors
///
/// Returns the first read or write error other than an interrupted call.
pub fn relay(mut reader: impl Read, mut writer: impl Write) -> io::Result<u64> {
    let mut buf = [0_u8; RELAY_BUFFER_SIZE];
    let mut total = 0_u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        writer.flush()?;
        total += n as u64;
    }
    Ok(total)
}

fn spawn_relay(
    name: &'static str,
    reader: impl Read + Send + 'static,
    writer: impl Write + Send + 'static,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = relay(reader, writer) {
            tracing::debug!(stream = name, error = %e, "relay stopped");
        }
    })
}

/// Relays the piped stdio of `child` through `io` and waits for it to exit.
///
/// stdout and stderr each get their own thread, joined before returning.
/// The stdin relay is detached: it may stay blocked reading the invoking
/// process's stdin after the child has exited.
///
/// # Errors
///
/// Returns an error if waiting for the child fails.
pub fn relay_child(child: &mut Child, io: ExecIo) -> io::Result<ExitStatus> {
    let ExecIo {
        stdin,
        stdout,
        stderr,
        ..
    } = io;

    if let (Some(source), Some(sink)) = (stdin, child.stdin.take()) {
        drop(spawn_relay("stdin", source, sink));
    }
    let out = child
        .stdout
        .take()
        .map(|pipe| spawn_relay("stdout", pipe, stdout));
    let err = child
        .stderr
        .take()
        .map(|pipe| spawn_relay("stderr", pipe, stderr));

    let status = child.wait()?;
    for handle in [out, err].into_iter().flatten() {
        if handle.join().is_err() {
            tracing::warn!("output relay thread panicked");
        }
    }
    Ok(ExitStatus::from(status))
}

/// Executes commands in running sessions.
pub struct CommandExecutor<'a> {
    engine: &'a dyn ContainerEngine,
    retry: &'a RetryPolicy,
}

impl<'a> CommandExecutor<'a> {
    /// Creates an executor on top of an engine. Engine queries made before
    /// launching the command are retried under `retry`.
    #[must_use]
    pub fn new(engine: &'a dyn ContainerEngine, retry: &'a RetryPolicy) -> Self {
        Self { engine, retry }
    }

    /// Runs `command` with `args` in the session's container.
    ///
    /// `host_cwd` is translated through the session mounts to become the
    /// working directory inside the container. The container reference is
    /// taken from `session` as it was when its lifecycle was confirmed; if
    /// that container no longer runs, the execution is refused rather than
    /// silently recreating it.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::PathNotMounted` if `host_cwd` is outside every
    /// mount, `DboxError::SessionVanished` if the container is gone, or an
    /// engine error if the command cannot be launched.
    pub fn exec(
        &self,
        session: &Session,
        host_cwd: &Path,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        io: ExecIo,
    ) -> Result<ExitStatus> {
        let workdir = container_path_for(&session.mounts, host_cwd).ok_or_else(|| {
            DboxError::PathNotMounted {
                path: host_cwd.to_path_buf(),
            }
        })?;
        let container = session
            .container_ref
            .clone()
            .ok_or_else(|| DboxError::SessionVanished {
                container: session.container_name.clone(),
            })?;

        match self.retry.run("inspect", || self.engine.inspect(&container))? {
            Some(ContainerStatus::Running) => {}
            status => {
                tracing::warn!(id = %container, ?status, "session container is no longer running");
                return Err(DboxError::SessionVanished {
                    container: container.to_string(),
                });
            }
        }

        let request = ExecRequest {
            command: command.to_string(),
            args: args.to_vec(),
            workdir,
            env: env.to_vec(),
            user: Some(format!(
                "{}:{}",
                session.identity.container_uid, session.identity.container_gid
            )),
        };
        tracing::info!(
            id = %container,
            cmd = %request.command,
            args = ?request.args,
            cwd = %request.workdir.display(),
            "exec into session"
        );
        let status = self.engine.exec(&container, &request, io)?;
        tracing::debug!(id = %container, code = status.code(), "command finished");
        Ok(status)
    }
}
