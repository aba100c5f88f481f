//! PTY session management for Steppe
//!
//! Owns the shell processes behind a terminal frontend. A frontend creates
//! sessions, writes keystrokes, polls for output and forwards size changes;
//! everything else (child reaping, output buffering, teardown) happens here.
//!
//! - [`PtyHandle`]: one PTY master plus the child running on its slave side.
//! - [`SessionRegistry`]: the table of live sessions and their lifecycle.
//! - [`IoBridge`]: background output pump and ordered, cancellable writes.
//! - [`WindowSize`]: validated dimensions applied by the resize controller.

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod pty;
pub mod registry;
pub mod resize;
pub mod session;

pub use bridge::{IoBridge, OutputChunk};
pub use buffer::{OutputBuffer, OutputStats};
pub use config::RegistryConfig;
pub use pty::{ChildProcess, ExitStatus, Pty, PtyHandle};
pub use registry::SessionRegistry;
pub use resize::{ResizeController, WindowSize};
pub use session::{SessionId, SessionInfo, SessionState, ShellCommand};

use thiserror::Error;

/// Errors from PTY allocation and process spawning.
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to allocate PTY: {0}")]
    AllocationFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("PTY I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors returned by session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to start shell: {0}")]
    Spawn(#[from] PtyError),

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Invalid terminal dimensions: {rows} rows x {cols} cols")]
    InvalidDimensions { rows: u16, cols: u16 },

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Operation on session {0} timed out")]
    Timeout(SessionId),

    /// The write deadline passed after the child had accepted `written`
    /// bytes; resume from there rather than resending the whole buffer.
    #[error("Write to session {id} timed out after {written} bytes")]
    PartialWrite { id: SessionId, written: usize },

    #[error("Session limit reached ({0})")]
    LimitReached(usize),

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True for errors after which the caller should stop polling the session.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::SessionClosed(_) | SessionError::NotFound(_))
    }

    /// True when an operation ran out of time but the session is still usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_) | SessionError::PartialWrite { .. })
    }
}
