//! Command line entry point and the terminal <-> session loop

use crate::config::{default_config_path, HostConfig};
use crate::logging::{LogLevel, Logging};
use crate::terminal::RawTerminal;
use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use steppe_pty::{SessionError, SessionId, SessionRegistry, WindowSize};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long the input thread blocks before checking for shutdown
const INPUT_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Steppe - run a shell through the steppe session manager")]
pub struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/steppe/config.toml, created if missing)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Shell to run (defaults to the config file, then $SHELL, then /bin/sh)
    #[arg(long)]
    pub shell: Option<PathBuf>,

    /// Arguments passed to the shell
    #[arg(last = true)]
    pub shell_args: Vec<String>,

    /// Working directory for the shell
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Terminal rows (defaults to the current terminal)
    #[arg(long)]
    pub rows: Option<u16>,

    /// Terminal columns (defaults to the current terminal)
    #[arg(long)]
    pub cols: Option<u16>,

    /// Maximum unread output kept per session, in bytes
    #[arg(long)]
    pub buffer_capacity: Option<usize>,

    /// How often to poll the session for output
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Timeout for a single write or resize
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Load the config file and lay the flags given on the command line over it
    pub fn load_config(&self) -> Result<HostConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => default_config_path().context("Cannot locate a config directory; pass --config")?,
        };
        let mut config = HostConfig::load_or_create(&path)?;
        self.apply_to(&mut config);
        Ok(config)
    }

    pub fn apply_to(&self, config: &mut HostConfig) {
        if let Some(shell) = &self.shell {
            // A different shell does not inherit the configured arguments
            config.shell.program = Some(shell.clone());
            config.shell.args = self.shell_args.clone();
        } else if !self.shell_args.is_empty() {
            config.shell.args = self.shell_args.clone();
        }
        if let Some(cwd) = &self.cwd {
            config.shell.cwd = Some(cwd.clone());
        }
        if let Some(bytes) = self.buffer_capacity {
            config.session.buffer_capacity = bytes;
        }
        if let Some(ms) = self.io_timeout_ms {
            config.session.io_timeout_ms = ms;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.host.poll_interval_ms = ms;
        }
        if let Some(level) = self.log_level {
            config.host.log_level = level;
        }
    }

    /// Explicit `--rows`/`--cols` win over the detected `(cols, rows)` of the
    /// host terminal
    pub fn window_size(&self, detected: Option<(u16, u16)>) -> Result<WindowSize> {
        let fallback = WindowSize::default();
        let (detected_cols, detected_rows) =
            detected.unwrap_or((fallback.cols(), fallback.rows()));
        let rows = self.rows.unwrap_or(detected_rows);
        let cols = self.cols.unwrap_or(detected_cols);
        Ok(WindowSize::new(rows, cols)?)
    }
}

/// Input from the host terminal
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostInput {
    Bytes(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

pub async fn run() -> Result<()> {
    run_with(Args::parse()).await
}

pub async fn run_with(args: Args) -> Result<()> {
    let config = args.load_config()?;
    let logging = Logging::init(config.host.log_level, args.log_file.as_deref())?;

    let registry = SessionRegistry::new(config.registry_config());
    let size = args.window_size(terminal::size().ok())?;

    // No session, no loop: a failed spawn is reported before the terminal is
    // touched
    let id = registry
        .create_with(config.shell_command(), size)
        .await
        .context("Failed to start shell")?;
    info!(session = %id, %size, "shell started");

    let mut raw = RawTerminal::enter(&logging)?;
    let result = drive_session(&registry, id, config.poll_interval()).await;
    raw.restore()?;

    registry.close_all().await;
    result
}

/// Pump keystrokes into the session and its output onto stdout until the
/// session closes
async fn drive_session(registry: &SessionRegistry, id: SessionId, poll: Duration) -> Result<()> {
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let input_handle = tokio::task::spawn_blocking(move || read_terminal_events(input_tx, shutdown_rx));

    let mut ticker = time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stdout = io::stdout();

    let result = loop {
        tokio::select! {
            Some(input) = input_rx.recv() => {
                let outcome = match input {
                    HostInput::Bytes(bytes) => send_input(registry, id, &bytes).await,
                    HostInput::Resize { rows, cols } => registry.resize(id, rows, cols).await,
                };
                match outcome {
                    Ok(()) => {}
                    Err(e) if e.is_closed() => break Ok(()),
                    Err(e @ (SessionError::Timeout(_) | SessionError::InvalidDimensions { .. })) => {
                        warn!(session = %id, "input dropped: {e}");
                    }
                    Err(e) => break Err(e.into()),
                }
            }

            _ = ticker.tick() => {
                match registry.poll(id).await {
                    Ok(chunk) => {
                        if chunk.dropped > 0 {
                            debug!(session = %id, dropped = chunk.dropped, "output dropped before it was shown");
                        }
                        if let Err(e) = write_output(&mut stdout, &chunk.data) {
                            break Err(e).context("Failed to write to terminal");
                        }
                    }
                    Err(e) if e.is_closed() => break Ok(()),
                    Err(e) => break Err(e.into()),
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = input_handle.await;
    info!(session = %id, "session ended");
    result
}

/// Write keystrokes, picking up after whatever prefix a timed-out write
/// already delivered
async fn send_input(registry: &SessionRegistry, id: SessionId, data: &[u8]) -> Result<(), SessionError> {
    let mut sent = 0;
    loop {
        match registry.write(id, &data[sent..]).await {
            Ok(()) => return Ok(()),
            Err(SessionError::PartialWrite { written, .. }) => sent += written,
            Err(e) => return Err(e),
        }
    }
}

fn write_output(stdout: &mut io::Stdout, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    stdout.write_all(data)?;
    stdout.flush()
}

/// Blocking loop translating crossterm events, run on the blocking pool
fn read_terminal_events(input_tx: mpsc::UnboundedSender<HostInput>, shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        match event::poll(INPUT_POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("terminal event poll failed: {e}");
                break;
            }
        }

        let input = match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => match key_to_bytes(key) {
                Some(bytes) => HostInput::Bytes(bytes),
                None => continue,
            },
            Ok(Event::Paste(text)) => HostInput::Bytes(text.into_bytes()),
            Ok(Event::Resize(cols, rows)) => HostInput::Resize { rows, cols },
            Ok(_) => continue,
            Err(e) => {
                warn!("terminal event read failed: {e}");
                break;
            }
        };

        if input_tx.send(input).is_err() {
            break;
        }
    }
}

/// Encode a key press the way an xterm-compatible terminal would
pub fn key_to_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    let mut bytes = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            vec![control_byte(c)?]
        }
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        }
        KeyCode::F(n) => function_key(n)?.to_vec(),
        code => named_key(code)?.to_vec(),
    };

    // Meta sends an ESC prefix
    if key.modifiers.contains(KeyModifiers::ALT) {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

fn control_byte(c: char) -> Option<u8> {
    match c.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
        ' ' | '@' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' | '/' => Some(0x1f),
        '8' | '?' => Some(0x7f),
        _ => None,
    }
}

fn named_key(code: KeyCode) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match code {
        KeyCode::Enter => b"\r",
        KeyCode::Tab => b"\t",
        KeyCode::BackTab => b"\x1b[Z",
        KeyCode::Backspace => b"\x7f",
        KeyCode::Esc => b"\x1b",
        KeyCode::Up => b"\x1b[A",
        KeyCode::Down => b"\x1b[B",
        KeyCode::Right => b"\x1b[C",
        KeyCode::Left => b"\x1b[D",
        KeyCode::Home => b"\x1b[H",
        KeyCode::End => b"\x1b[F",
        KeyCode::Insert => b"\x1b[2~",
        KeyCode::Delete => b"\x1b[3~",
        KeyCode::PageUp => b"\x1b[5~",
        KeyCode::PageDown => b"\x1b[6~",
        _ => return None,
    };
    Some(bytes)
}

fn function_key(n: u8) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(bytes)
}
