use anyhow::Result;
use std::path::{Path, PathBuf};
use steppe_pty::ShellCommand;
use tempfile::TempDir;

/// Scratch directory for scripts run inside test sessions
pub struct TestFixtures {
    temp_dir: TempDir,
}

impl TestFixtures {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    /// Write an executable shell script
    pub fn create_test_script(&self, name: &str, content: &str) -> Result<PathBuf> {
        let script_path = self.temp_dir.path().join(name);
        std::fs::write(&script_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms)?;
        }

        Ok(script_path)
    }

    /// A command that runs `body` under `/bin/sh`
    pub fn script_command(&self, name: &str, body: &str) -> Result<ShellCommand> {
        let script = self.create_test_script(name, &format!("#!/bin/sh\n{body}\n"))?;
        Ok(ShellCommand::new(script))
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

// Common test data
pub mod data {
    pub const UNICODE_TEST: &str = "🦀 Rust 日本語 العربية\n";

    pub fn generate_text_lines(count: usize) -> String {
        (0..count)
            .map(|i| format!("Line {i}: The quick brown fox jumps over the lazy dog"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
