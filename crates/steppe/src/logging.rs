//! Log output for the host
//!
//! Logs go to stderr unless `--log-file` is given. Stderr shares the screen
//! with the shell, so stderr logging is switched off while the terminal is in
//! raw mode and back on afterwards.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

type StderrSwitch = reload::Handle<LevelFilter, Registry>;

/// The installed logger
pub struct Logging {
    level: LevelFilter,
    stderr: Option<StderrSwitch>,
}

impl Logging {
    /// Install the global subscriber: `log_file` with ANSI colours off when
    /// given, otherwise stderr.
    ///
    /// If a subscriber is already installed it is left in place.
    pub fn init(level: LogLevel, log_file: Option<&Path>) -> Result<Self> {
        let level = LevelFilter::from_level(level.into());

        let (installed, stderr) = match log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log file {}", path.display()))?;
                let installed = tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init();
                (installed, None)
            }
            None => {
                let (subscriber, switch) = stderr_subscriber(level, io::stderr);
                (subscriber.try_init().map_err(Into::into), Some(switch))
            }
        };

        match installed {
            Ok(()) => Ok(Self { level, stderr }),
            Err(e) => {
                debug!("keeping existing logger: {e}");
                Ok(Self {
                    level,
                    stderr: None,
                })
            }
        }
    }

    /// Silence stderr logging; file logging is unaffected
    pub fn pause_stderr(&self) {
        self.set_stderr_level(LevelFilter::OFF);
    }

    pub fn resume_stderr(&self) {
        self.set_stderr_level(self.level);
    }

    fn set_stderr_level(&self, level: LevelFilter) {
        if let Some(switch) = &self.stderr {
            // Only fails once the subscriber is gone
            let _ = switch.reload(level);
        }
    }
}

fn stderr_subscriber<W>(level: LevelFilter, writer: W) -> (impl Subscriber + Send + Sync, StderrSwitch)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let (filter, switch) = reload::Layer::new(level);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer));
    (subscriber, switch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tracing::{info, warn};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_paused_stderr_drops_events() {
        let capture = Capture::default();
        let (subscriber, switch) = stderr_subscriber(LevelFilter::INFO, {
            let capture = capture.clone();
            move || capture.clone()
        });
        let logging = Logging {
            level: LevelFilter::INFO,
            stderr: Some(switch),
        };

        tracing::subscriber::with_default(subscriber, || {
            info!("before-raw-mode");
            logging.pause_stderr();
            warn!("during-raw-mode");
            logging.resume_stderr();
            info!("after-raw-mode");
        });

        let text = capture.text();
        assert!(text.contains("before-raw-mode"), "got {text:?}");
        assert!(!text.contains("during-raw-mode"), "got {text:?}");
        assert!(text.contains("after-raw-mode"), "got {text:?}");
    }

    #[test]
    fn test_level_filters_stderr() {
        let capture = Capture::default();
        let (subscriber, _switch) = stderr_subscriber(LevelFilter::WARN, {
            let capture = capture.clone();
            move || capture.clone()
        });

        tracing::subscriber::with_default(subscriber, || {
            info!("too-quiet");
            warn!("loud-enough");
        });

        let text = capture.text();
        assert!(!text.contains("too-quiet"));
        assert!(text.contains("loud-enough"));
    }

    #[test]
    fn test_log_level_names() {
        use serde::de::value::{Error, StrDeserializer};
        use serde::de::IntoDeserializer;

        let name: StrDeserializer<'_, Error> = "trace".into_deserializer();
        assert_eq!(LogLevel::deserialize(name).unwrap(), LogLevel::Trace);
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
    }
}
