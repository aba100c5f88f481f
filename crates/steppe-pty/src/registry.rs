//! Table of live sessions and their lifecycle
//!
//! Sessions are looked up under a coarse `RwLock` that is only held long
//! enough to clone the session's `Arc`; everything after that goes through
//! per-session locks, so a slow write on one session never blocks another.
//!
//! Each session gets a watcher task that notices when the child exits on its
//! own and tears the session down without waiting for an explicit close.
//! Output that was still unread at teardown stays available for one final
//! poll until `residue_ttl` expires.

use crate::bridge::OutputChunk;
use crate::buffer::{OutputBuffer, OutputStats};
use crate::config::RegistryConfig;
use crate::pty::ExitStatus;
use crate::resize::WindowSize;
use crate::session::{left_active, Session, SessionId, SessionInfo, SessionState, ShellCommand};
use crate::SessionError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Manages PTY sessions for one hosting application.
///
/// Cheap to clone; clones share the same table. When the last clone is
/// dropped every remaining child process is killed.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    residue: Mutex<HashMap<SessionId, Residue>>,
}

/// Unread output of a closed session
struct Residue {
    output: Arc<AsyncMutex<OutputBuffer>>,
    expires: Instant,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: RwLock::new(HashMap::new()),
                residue: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Start the configured default shell at the default size
    pub async fn create(&self) -> Result<SessionId, SessionError> {
        let config = &self.inner.config;
        self.create_with(config.default_command.clone(), config.default_size)
            .await
    }

    /// Start `command` in a new PTY of `size`.
    ///
    /// Nothing is registered unless the child was spawned successfully.
    pub async fn create_with(
        &self,
        command: ShellCommand,
        size: WindowSize,
    ) -> Result<SessionId, SessionError> {
        self.inner.sweep_residue();

        let config = &self.inner.config;
        let max = config.max_sessions;
        if self.inner.sessions.read().await.len() >= max {
            return Err(SessionError::LimitReached(max));
        }

        let session = match Session::spawn(&command, size, config) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(program = %command.program().display(), "failed to create session: {e}");
                return Err(e);
            }
        };
        let id = session.id();

        {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.len() >= max {
                drop(sessions);
                // Lost a race with another create
                session.begin_close();
                session.close(config.close_grace).await;
                return Err(SessionError::LimitReached(max));
            }
            sessions.insert(id, session.clone());
            info!(session = %id, total = sessions.len(), "registered session");
        }

        self.spawn_exit_watcher(session);
        Ok(id)
    }

    /// Send `data` to the session's shell.
    ///
    /// Bytes from sequential calls reach the child in call order. A write
    /// that runs past `io_timeout` fails with `Timeout` if nothing was sent,
    /// or with `PartialWrite` naming how many leading bytes the child got;
    /// retrying with the remainder keeps the stream intact.
    pub async fn write(&self, id: SessionId, data: &[u8]) -> Result<(), SessionError> {
        let session = self.open_session(id).await?;
        let result = session.write(data, self.inner.config.io_timeout).await;
        if let Err(e) = &result {
            if e.is_timeout() {
                warn!(session = %id, bytes = data.len(), "write timed out: {e}");
            }
        }
        result
    }

    /// Output produced since the previous read; empty when there is none yet
    pub async fn read(&self, id: SessionId) -> Result<Bytes, SessionError> {
        self.poll(id).await.map(|chunk| chunk.data)
    }

    /// Like [`read`](Self::read), also reporting bytes lost to the buffer cap.
    ///
    /// Never waits on the PTY. After the session closes, output that was
    /// still buffered is returned once; after that the session reports
    /// `SessionClosed`.
    pub async fn poll(&self, id: SessionId) -> Result<OutputChunk, SessionError> {
        self.inner.sweep_residue();
        let session = self.inner.sessions.read().await.get(&id).cloned();

        if let Some(session) = session {
            // Closed is only set after the final drain, so checking first
            // guarantees the take below sees everything.
            let closed = session.state() == SessionState::Closed;
            let chunk = session.take_output().await;
            if !closed || !chunk.data.is_empty() {
                return Ok(chunk);
            }
            self.inner.take_residue(id);
            return Err(SessionError::SessionClosed(id));
        }

        match self.inner.take_residue(id) {
            Some(output) => {
                let (data, dropped) = output.lock().await.take();
                if data.is_empty() {
                    Err(SessionError::SessionClosed(id))
                } else {
                    Ok(OutputChunk { data, dropped })
                }
            }
            None => Err(SessionError::SessionClosed(id)),
        }
    }

    /// Change the session's window size. Requesting the current size is a
    /// successful no-op.
    pub async fn resize(&self, id: SessionId, rows: u16, cols: u16) -> Result<(), SessionError> {
        let size = WindowSize::new(rows, cols)?;
        let session = self.open_session(id).await?;
        match session.resize(size, self.inner.config.io_timeout).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_timeout() {
                    warn!(session = %id, rows, cols, "resize timed out");
                }
                Err(e)
            }
        }
    }

    /// Dimensions from the last successful resize
    pub async fn size(&self, id: SessionId) -> Result<WindowSize, SessionError> {
        Ok(self.session(id).await?.size())
    }

    /// Terminate the session's child and release its PTY.
    ///
    /// Returns the child's exit status if it could be reaped. Closing an
    /// unknown session, or one that is already closing, reports `NotFound`.
    pub async fn close(&self, id: SessionId) -> Result<Option<ExitStatus>, SessionError> {
        let session = self.session(id).await?;
        if !session.begin_close() {
            return Err(SessionError::NotFound(id));
        }

        let status = session.close(self.inner.config.close_grace).await;
        self.inner.finish(&session).await;
        self.inner.sweep_residue();
        Ok(status)
    }

    /// Close every open session, returning how many were closed
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.inner.sessions.read().await.keys().copied().collect();

        let mut closes = JoinSet::new();
        for id in ids {
            let registry = self.clone();
            closes.spawn(async move { registry.close(id).await });
        }

        let mut closed = 0;
        while let Some(result) = closes.join_next().await {
            match result {
                Ok(Ok(_)) => closed += 1,
                Ok(Err(e)) => debug!("skipped session during close_all: {e}"),
                Err(e) => warn!("close task failed: {e}"),
            }
        }
        info!(closed, "closed all sessions");
        closed
    }

    /// Number of sessions that are active or closing
    pub async fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.state() != SessionState::Closed)
            .count()
    }

    /// Snapshots of every registered session, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn info(&self, id: SessionId) -> Result<SessionInfo, SessionError> {
        Ok(self.session(id).await?.info().await)
    }

    pub async fn output_stats(&self, id: SessionId) -> Result<OutputStats, SessionError> {
        Ok(self.session(id).await?.output_stats().await)
    }

    async fn session(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Lookup for operations that need a live PTY
    async fn open_session(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        match self.inner.sessions.read().await.get(&id) {
            Some(session) if session.state() == SessionState::Active => Ok(session.clone()),
            _ => Err(SessionError::SessionClosed(id)),
        }
    }

    fn spawn_exit_watcher(&self, session: Arc<Session>) {
        let registry = Arc::downgrade(&self.inner);
        let interval = self.inner.config.exit_poll_interval;
        tokio::spawn(watch_for_exit(registry, session, interval));
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl RegistryInner {
    /// Park unread output for a final poll, then drop the session from the
    /// table. Must run after the session reached `Closed`.
    async fn finish(&self, session: &Session) {
        let id = session.id();
        let output = session.output().clone();
        if !output.lock().await.is_empty() {
            let expires = Instant::now() + self.config.residue_ttl;
            self.lock_residue().insert(id, Residue { output, expires });
        }

        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        debug!(session = %id, remaining = sessions.len(), "removed session");
    }

    fn take_residue(&self, id: SessionId) -> Option<Arc<AsyncMutex<OutputBuffer>>> {
        let residue = self.lock_residue().remove(&id)?;
        (residue.expires > Instant::now()).then_some(residue.output)
    }

    fn sweep_residue(&self) {
        let now = Instant::now();
        self.lock_residue().retain(|id, residue| {
            let keep = residue.expires > now;
            if !keep {
                debug!(session = %id, "discarding unread output of closed session");
            }
            keep
        });
    }

    fn lock_residue(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Residue>> {
        self.residue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for session in self.sessions.get_mut().values() {
            // Claiming the close also stops the session's watcher
            if session.begin_close() {
                debug!(session = %session.id(), pid = session.pid(), "killing session on registry drop");
                if let Err(e) = session.kill() {
                    warn!(session = %session.id(), "failed to kill child: {e}");
                }
            }
        }
    }
}

/// Tear the session down once its child exits, unless someone else starts
/// closing it first
async fn watch_for_exit(
    registry: Weak<RegistryInner>,
    session: Arc<Session>,
    interval: std::time::Duration,
) {
    let id = session.id();
    let mut state = session.subscribe_state();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = left_active(&mut state) => return,
            _ = ticker.tick() => {}
        }

        match session.poll_exit() {
            Ok(None) => continue,
            Ok(Some(status)) => {
                info!(session = %id, %status, "shell exited");
                break;
            }
            Err(e) => {
                warn!(session = %id, "lost track of child process: {e}");
                break;
            }
        }
    }

    if !session.begin_close() {
        return;
    }
    session.retire().await;

    if let Some(registry) = registry.upgrade() {
        registry.finish(&session).await;
    }
}
