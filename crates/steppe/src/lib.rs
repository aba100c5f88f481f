//! Steppe host: drives one shell session from the real terminal
//!
//! The host plays the part of a terminal widget: it forwards keystrokes and
//! size changes to a [`steppe_pty::SessionRegistry`] and polls for output on
//! a timer. Defaults come from a per-user config file.

pub mod config;
pub mod host;
pub mod logging;
pub mod terminal;

pub use config::HostConfig;
pub use host::{run, run_with, Args};
