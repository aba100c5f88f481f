//! Low-level PTY allocation and child process management
//!
//! Unix only: the master side is switched to non-blocking mode and driven
//! through tokio's reactor, the child becomes a session leader with the PTY
//! slave as its controlling terminal.

use crate::resize::{self, WindowSize};
use crate::session::ShellCommand;
use crate::PtyError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// A freshly allocated pseudo-terminal pair
pub struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    /// Allocate a new PTY pair with the given initial window size
    pub fn new(size: WindowSize) -> Result<Self, PtyError> {
        let winsize = size.to_winsize();
        let OpenptyResult { master, slave } = openpty(Some(&winsize), None)
            .map_err(|e| PtyError::AllocationFailed(format!("openpty failed: {e}")))?;

        // Neither side may leak into children spawned for other sessions, or
        // their EOF would be delayed until that unrelated child exits.
        set_cloexec(master.as_raw_fd())?;
        set_cloexec(slave.as_raw_fd())?;
        set_nonblocking(master.as_raw_fd())?;

        Ok(Self { master, slave })
    }

    /// Current window size as seen by the kernel
    pub fn window_size(&self) -> io::Result<WindowSize> {
        resize::query_window_size(&self.master)
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> io::Result<()> {
        resize::set_window_size(&self.master, size)
    }

    /// Spawn a process on the slave side, consuming the pair.
    ///
    /// Must be called from within a tokio runtime: the master is registered
    /// with the reactor.
    pub fn spawn(self, command: &ShellCommand, term: &str) -> Result<PtyHandle, PtyError> {
        let Pty { master, slave } = self;

        let mut cmd = Command::new(command.program());
        cmd.args(command.arguments());
        if let Some(cwd) = command.working_dir() {
            cmd.current_dir(cwd);
        }
        for (key, value) in command.environment() {
            cmd.env(key, value);
        }
        cmd.env("TERM", term);

        cmd.stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        // SAFETY: the closure runs between fork and exec and only makes
        // async-signal-safe calls (setsid, ioctl).
        unsafe {
            cmd.pre_exec(|| {
                setsid()?;
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            PtyError::SpawnFailed(format!("{}: {e}", command.program().display()))
        })?;
        // The parent's copies of the slave live inside `cmd`; dropping it here
        // leaves the child as the only holder, so the master sees EOF on exit.
        drop(cmd);

        debug!(pid = child.id(), program = %command.program().display(), "spawned PTY process");

        let master = AsyncFd::new(File::from(master))?;
        Ok(PtyHandle {
            master: Arc::new(master),
            child: Arc::new(ChildProcess::new(child)),
        })
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

/// One PTY master plus the child process running on its slave side
pub struct PtyHandle {
    master: Arc<AsyncFd<File>>,
    child: Arc<ChildProcess>,
}

impl PtyHandle {
    /// Allocate a PTY of `size` and start `command` on it
    pub fn spawn(command: &ShellCommand, size: WindowSize, term: &str) -> Result<Self, PtyError> {
        Pty::new(size)?.spawn(command, term)
    }

    /// The non-blocking master side
    pub fn master(&self) -> &Arc<AsyncFd<File>> {
        &self.master
    }

    /// The child process
    pub fn child(&self) -> &Arc<ChildProcess> {
        &self.child
    }

    /// Process ID of the child
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }
}

impl fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyHandle")
            .field("master", &self.master.as_raw_fd())
            .field("pid", &self.child.pid())
            .finish()
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this code
    Exited(i32),
    /// Killed by this signal number
    Signaled(i32),
}

impl ExitStatus {
    /// Shell-style exit code: signals map to `128 + signal`
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Exited(code),
            (None, Some(signal)) => ExitStatus::Signaled(signal),
            (None, None) => ExitStatus::Exited(-1),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// A child process running in a PTY.
///
/// Waiting and signalling go through one lock so a signal can never hit a
/// recycled PID after the child has been reaped.
pub struct ChildProcess {
    pid: u32,
    inner: Mutex<Child>,
}

impl ChildProcess {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            inner: Mutex::new(child),
        }
    }

    /// Process ID (also the process group ID, the child calls `setsid`)
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking check for exit; reaps the child once it has exited
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let mut child = self.lock();
        Ok(child.try_wait()?.map(ExitStatus::from))
    }

    /// Send `signal` to the child's process group unless it has already exited
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        let mut child = self.lock();
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        match killpg(self.process_group(), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn process_group(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let child = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Ok(None) = child.try_wait() {
            warn!(pid = self.pid, "killing orphaned PTY process");
            let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
            let _ = child.wait();
        }
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn set_cloexec(fd: RawFd) -> Result<(), PtyError> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| PtyError::AllocationFailed(format!("Failed to set close-on-exec: {e}")))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), PtyError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| PtyError::AllocationFailed(format!("Failed to read flags: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| PtyError::AllocationFailed(format!("Failed to set non-blocking: {e}")))?;
    Ok(())
}
