//! Raw mode for the host terminal

use crate::logging::Logging;
use anyhow::{Context, Result};
use crossterm::terminal;
use std::sync::Once;

/// Keeps the host terminal in raw mode, with stderr logging paused, until it
/// is restored or dropped.
pub struct RawTerminal<'a> {
    logging: &'a Logging,
    raw: bool,
}

impl<'a> RawTerminal<'a> {
    pub fn enter(logging: &'a Logging) -> Result<Self> {
        restore_on_panic();
        logging.pause_stderr();

        if let Err(e) = terminal::enable_raw_mode() {
            logging.resume_stderr();
            return Err(e).context("Failed to put the terminal in raw mode");
        }
        Ok(Self { logging, raw: true })
    }

    /// Leave raw mode and resume stderr logging
    pub fn restore(&mut self) -> Result<()> {
        if !self.raw {
            return Ok(());
        }
        self.raw = false;
        let restored = terminal::disable_raw_mode().context("Failed to restore the terminal");
        self.logging.resume_stderr();
        restored
    }
}

impl Drop for RawTerminal<'_> {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// Leave raw mode before the default hook prints the panic message
fn restore_on_panic() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = terminal::disable_raw_mode();
            default_hook(info);
        }));
    });
}
