//! Session identity, shell commands and per-session state

use crate::bridge::{IoBridge, OutputChunk};
use crate::buffer::{OutputBuffer, OutputStats};
use crate::config::RegistryConfig;
use crate::pty::{self, ChildProcess, ExitStatus, PtyHandle};
use crate::resize::{ResizeController, WindowSize};
use crate::SessionError;
use nix::sys::signal::Signal;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Accepting writes and resizes
    Active,
    /// Teardown in progress
    Closing,
    /// Child reaped and PTY released
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The program to run inside a session's PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// The user's login shell from `$SHELL`, or `/bin/sh`
    pub fn default_shell() -> Self {
        Self::new(pty::default_shell())
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::default_shell()
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub size: WindowSize,
    pub pid: u32,
    pub program: PathBuf,
    pub created_at: SystemTime,
    pub exit_status: Option<ExitStatus>,
    pub output: OutputStats,
}

/// Descriptor-owning half of a session, guarded by the session's I/O lock
struct SessionIo {
    pty: Option<PtyHandle>,
    bridge: Option<IoBridge>,
}

/// One shell process, its PTY and its output buffer.
///
/// Write, resize and teardown hold the I/O lock; polling output only locks the
/// buffer, which outlives the descriptor so output can be drained after close.
pub(crate) struct Session {
    id: SessionId,
    state: watch::Sender<SessionState>,
    io: Mutex<SessionIo>,
    output: Arc<Mutex<OutputBuffer>>,
    resize: ResizeController,
    child: Arc<ChildProcess>,
    program: PathBuf,
    created_at: SystemTime,
    exit_status: std::sync::Mutex<Option<ExitStatus>>,
}

impl Session {
    /// Allocate a PTY, start `command` on it and begin pumping its output
    pub(crate) fn spawn(
        command: &ShellCommand,
        size: WindowSize,
        config: &RegistryConfig,
    ) -> Result<Self, SessionError> {
        let id = SessionId::new();
        let handle = PtyHandle::spawn(command, size, &config.term)?;
        let bridge = IoBridge::start(id, handle.master().clone(), config.buffer_capacity);
        let (state, _) = watch::channel(SessionState::Active);

        info!(session = %id, pid = handle.pid(), rows = size.rows(), cols = size.cols(), "session started");

        Ok(Self {
            id,
            state,
            output: bridge.output().clone(),
            resize: ResizeController::new(size),
            child: handle.child().clone(),
            program: command.program().to_path_buf(),
            created_at: SystemTime::now(),
            exit_status: std::sync::Mutex::new(None),
            io: Mutex::new(SessionIo {
                pty: Some(handle),
                bridge: Some(bridge),
            }),
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.pid()
    }

    /// Kill the child's process group without waiting
    pub(crate) fn kill(&self) -> io::Result<()> {
        self.child.signal(Signal::SIGKILL)
    }

    /// Move from `Active` to `Closing`. Only one caller ever wins, and that
    /// caller owns the teardown.
    pub(crate) fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Write `data` to the child's input within `limit`.
    ///
    /// Fails with `SessionClosed` as soon as the session leaves `Active`,
    /// including while the write is waiting on a full PTY. When `limit`
    /// passes, nothing was sent if the error is `Timeout`; `PartialWrite`
    /// reports the prefix the child already accepted.
    pub(crate) async fn write(&self, data: &[u8], limit: Duration) -> Result<(), SessionError> {
        let mut state = self.state.subscribe();
        let mut written = 0;

        let outcome = tokio::select! {
            biased;

            _ = left_active(&mut state) => return Err(SessionError::SessionClosed(self.id)),

            outcome = time::timeout(limit, self.write_locked(data, &mut written)) => outcome,
        };

        match outcome {
            Ok(result) => result,
            Err(_elapsed) if written == 0 => Err(SessionError::Timeout(self.id)),
            Err(_elapsed) => Err(SessionError::PartialWrite {
                id: self.id,
                written,
            }),
        }
    }

    async fn write_locked(&self, data: &[u8], written: &mut usize) -> Result<(), SessionError> {
        let io = self.io.lock().await;
        let bridge = match (&io.bridge, self.state()) {
            (Some(bridge), SessionState::Active) => bridge,
            _ => return Err(SessionError::SessionClosed(self.id)),
        };
        bridge.write(data, written).await.map_err(|e| self.map_io_error(e))
    }

    /// Apply a new window size within `limit`; `Ok(false)` when it was
    /// already current
    pub(crate) async fn resize(&self, size: WindowSize, limit: Duration) -> Result<bool, SessionError> {
        let mut state = self.state.subscribe();

        tokio::select! {
            biased;

            _ = left_active(&mut state) => Err(SessionError::SessionClosed(self.id)),

            outcome = time::timeout(limit, self.resize_locked(size)) => {
                outcome.map_err(|_| SessionError::Timeout(self.id))?
            }
        }
    }

    async fn resize_locked(&self, size: WindowSize) -> Result<bool, SessionError> {
        let io = self.io.lock().await;
        let pty = match (&io.pty, self.state()) {
            (Some(pty), SessionState::Active) => pty,
            _ => return Err(SessionError::SessionClosed(self.id)),
        };
        self.resize
            .apply(pty.master().get_ref(), size)
            .map_err(|e| self.map_io_error(e))
    }

    pub(crate) fn size(&self) -> WindowSize {
        self.resize.current()
    }

    /// Drain buffered output
    pub(crate) async fn take_output(&self) -> OutputChunk {
        let (data, dropped) = self.output.lock().await.take();
        OutputChunk { data, dropped }
    }

    /// The output buffer, which outlives the PTY
    pub(crate) fn output(&self) -> &Arc<Mutex<OutputBuffer>> {
        &self.output
    }

    pub(crate) async fn output_stats(&self) -> OutputStats {
        self.output.lock().await.stats()
    }

    /// Check whether the child has exited, recording its status if so
    pub(crate) fn poll_exit(&self) -> Result<Option<ExitStatus>, SessionError> {
        if let Some(status) = self.exit_status() {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if let Some(status) = status {
            debug!(session = %self.id, %status, "child exited");
            *self.exit_status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        }
        Ok(status)
    }

    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminate the child and release the PTY. Caller must have won
    /// [`begin_close`](Self::begin_close).
    ///
    /// Sends `SIGHUP` to the process group, then `SIGKILL` if the child is
    /// still running after `grace`. Returns the exit status if the child could
    /// be reaped. Unread output stays in the buffer.
    pub(crate) async fn close(&self, grace: Duration) -> Option<ExitStatus> {
        let mut io = self.io.lock().await;

        let mut status = None;
        for signal in [Signal::SIGHUP, Signal::SIGKILL] {
            if let Ok(Some(exited)) = self.poll_exit() {
                status = Some(exited);
                break;
            }
            debug!(session = %self.id, pid = self.pid(), ?signal, "signalling child");
            if let Err(e) = self.child.signal(signal) {
                warn!(session = %self.id, "failed to signal child: {e}");
            }
            status = self.wait_for_exit(grace).await;
            if status.is_some() {
                break;
            }
        }
        if status.is_none() {
            warn!(session = %self.id, pid = self.pid(), "child did not exit after SIGKILL");
        }

        self.release(&mut io).await;
        status
    }

    /// Release the PTY of a child that has already exited
    pub(crate) async fn retire(&self) {
        let mut io = self.io.lock().await;
        self.release(&mut io).await;
    }

    /// Stop the output pump after a final drain, close the master and mark
    /// the session `Closed`
    async fn release(&self, io: &mut SessionIo) {
        if let Some(mut bridge) = io.bridge.take() {
            bridge.shutdown().await;
        }
        io.pty = None;

        let unread = self.output.lock().await.len();
        self.state.send_replace(SessionState::Closed);
        info!(
            session = %self.id,
            exit_status = ?self.exit_status(),
            unread,
            "session closed"
        );
    }

    async fn wait_for_exit(&self, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        loop {
            match self.poll_exit() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(session = %self.id, "failed to wait for child: {e}");
                    return None;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_CHECK_INTERVAL).await;
        }
    }

    pub(crate) async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state(),
            size: self.size(),
            pid: self.pid(),
            program: self.program.clone(),
            created_at: self.created_at,
            exit_status: self.exit_status(),
            output: self.output_stats().await,
        }
    }

    /// A PTY whose slave side is gone reports `EIO`
    fn map_io_error(&self, error: io::Error) -> SessionError {
        if error.raw_os_error() == Some(libc::EIO) {
            SessionError::SessionClosed(self.id)
        } else {
            SessionError::Io(error)
        }
    }
}

/// Resolves once the session has left `Active`
pub(crate) async fn left_active(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s != SessionState::Active).await;
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.child.pid())
            .field("size", &self.size())
            .finish()
    }
}
