//! Registry configuration

use crate::resize::WindowSize;
use crate::session::ShellCommand;
use std::time::Duration;

/// Tunables for a [`SessionRegistry`](crate::SessionRegistry)
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cap on unread output per session, in bytes
    pub buffer_capacity: usize,
    /// Bound on a single write or resize, including waiting for the session lock
    pub io_timeout: Duration,
    /// How long to wait for the child after each termination signal
    pub close_grace: Duration,
    /// How often each session's watcher checks for child exit
    pub exit_poll_interval: Duration,
    /// How long output of a closed session stays available for a final read
    pub residue_ttl: Duration,
    /// Maximum number of open sessions
    pub max_sessions: usize,
    /// Window size used by `create`
    pub default_size: WindowSize,
    /// Command used by `create`
    pub default_command: ShellCommand,
    /// Value of `TERM` in every child's environment
    pub term: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024 * 1024,
            io_timeout: Duration::from_secs(2),
            close_grace: Duration::from_secs(1),
            exit_poll_interval: Duration::from_millis(50),
            residue_ttl: Duration::from_secs(30),
            max_sessions: 64,
            default_size: WindowSize::default(),
            default_command: ShellCommand::default_shell(),
            term: "xterm-256color".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes.max(1);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_exit_poll_interval(mut self, interval: Duration) -> Self {
        self.exit_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_residue_ttl(mut self, ttl: Duration) -> Self {
        self.residue_ttl = ttl;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_default_size(mut self, size: WindowSize) -> Self {
        self.default_size = size;
        self
    }

    pub fn with_default_command(mut self, command: ShellCommand) -> Self {
        self.default_command = command;
        self
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }
}
