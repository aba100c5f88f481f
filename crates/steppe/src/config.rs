//! Per-user configuration file
//!
//! Lives at `$XDG_CONFIG_HOME/steppe/config.toml` (or `~/.config/steppe/`)
//! and is created with every setting commented out on first run. Command
//! line flags win over anything set here.

use crate::logging::LogLevel;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use steppe_pty::{RegistryConfig, ShellCommand};
use tracing::{debug, info};

/// Written when no config file exists yet
pub const DEFAULT_CONFIG: &str = r#"# Steppe configuration. Command line flags take precedence.

[shell]
# program = "/bin/zsh"
# args = ["-l"]
# cwd = "/home/me/src"

[shell.env]
# EDITOR = "vim"

[session]
# buffer_capacity = 1048576
# io_timeout_ms = 2000
# close_grace_ms = 1000
# term = "xterm-256color"

[host]
# poll_interval_ms = 16
# log_level = "warn"
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub shell: ShellConfig,
    pub session: SessionConfig,
    pub host: HostSection,
}

/// The shell started in the session
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    /// Falls back to `$SHELL`, then `/bin/sh`
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub buffer_capacity: usize,
    pub io_timeout_ms: u64,
    pub close_grace_ms: u64,
    pub term: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            buffer_capacity: registry.buffer_capacity,
            io_timeout_ms: registry.io_timeout.as_millis() as u64,
            close_grace_ms: registry.close_grace.as_millis() as u64,
            term: registry.term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostSection {
    pub poll_interval_ms: u64,
    pub log_level: LogLevel,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 16,
            log_level: LogLevel::Warn,
        }
    }
}

/// `$XDG_CONFIG_HOME/steppe/config.toml`, falling back to `~/.config`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("steppe").join("config.toml"))
}

impl HostConfig {
    /// Read `path`, writing [`DEFAULT_CONFIG`] there first if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            write_default(path)?;
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .with_buffer_capacity(self.session.buffer_capacity)
            .with_io_timeout(Duration::from_millis(self.session.io_timeout_ms))
            .with_close_grace(Duration::from_millis(self.session.close_grace_ms))
            .with_term(self.session.term.clone())
            .with_default_command(self.shell_command())
            .with_max_sessions(1)
    }

    pub fn shell_command(&self) -> ShellCommand {
        let shell = &self.shell;
        let mut command = match &shell.program {
            Some(program) => ShellCommand::new(program),
            None => ShellCommand::default_shell(),
        };
        command = command.args(shell.args.iter().cloned());
        if let Some(cwd) = &shell.cwd {
            command = command.cwd(cwd);
        }
        for (key, value) in &shell.env {
            command = command.env(key, value);
        }
        command
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.host.poll_interval_ms.max(1))
    }
}

fn write_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        // Another steppe got there first
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to create config file {}", path.display()))
        }
    };
    file.write_all(DEFAULT_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config file {}", path.display()))?;

    info!(path = %path.display(), "wrote default config file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_file_matches_defaults() {
        assert_eq!(HostConfig::parse(DEFAULT_CONFIG).unwrap(), HostConfig::default());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = HostConfig::parse(
            r#"
            [shell]
            program = "/bin/bash"
            args = ["--norc"]

            [shell.env]
            STEPPE_TEST = "1"

            [host]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.host.log_level, LogLevel::Debug);
        assert_eq!(config.host.poll_interval_ms, 16);
        assert_eq!(config.session, SessionConfig::default());

        let command = config.shell_command();
        assert_eq!(command.program(), Path::new("/bin/bash"));
        assert_eq!(command.arguments(), ["--norc"]);
        assert_eq!(command.environment(), [("STEPPE_TEST".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_session_settings_reach_registry() {
        let config = HostConfig::parse(
            r#"
            [session]
            buffer_capacity = 4096
            io_timeout_ms = 250
            term = "vt100"
            "#,
        )
        .unwrap();

        let registry = config.registry_config();
        assert_eq!(registry.buffer_capacity, 4096);
        assert_eq!(registry.io_timeout, Duration::from_millis(250));
        assert_eq!(registry.close_grace, Duration::from_secs(1));
        assert_eq!(registry.term, "vt100");
        assert_eq!(registry.max_sessions, 1);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(HostConfig::parse("[session]\nbuffer = 10\n").is_err());
        assert!(HostConfig::parse("[host]\nlog_level = \"loud\"\n").is_err());
    }

    #[test]
    fn test_default_path_is_under_steppe_dir() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("steppe/config.toml"));
        }
    }
}
