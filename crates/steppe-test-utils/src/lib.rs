pub mod fixtures;

pub use fixtures::TestFixtures;

use anyhow::{bail, Result};
use std::sync::Once;
use std::time::Duration;
use steppe_pty::{RegistryConfig, SessionError, SessionId, SessionRegistry, ShellCommand};
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("steppe=debug,steppe_pty=debug")),
            )
            .with_test_writer()
            .init();
    });
}

/// Registry settings suited to tests: `/bin/sh` instead of the user's shell
/// and short grace periods
pub fn test_config() -> RegistryConfig {
    RegistryConfig::default()
        .with_default_command(ShellCommand::new("/bin/sh"))
        .with_close_grace(Duration::from_millis(500))
        .with_exit_poll_interval(Duration::from_millis(10))
}

/// Poll `id` until its accumulated output contains `needle`.
///
/// Returns everything read so far. Fails on timeout or if the session closes
/// first.
pub async fn read_until(
    registry: &SessionRegistry,
    id: SessionId,
    needle: &str,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut seen = String::new();

    loop {
        match registry.read(id).await {
            Ok(data) => seen.push_str(&String::from_utf8_lossy(&data)),
            Err(e) if e.is_closed() => {
                bail!("session closed before {needle:?} appeared; output: {seen:?}")
            }
            Err(e) => return Err(e.into()),
        }
        if seen.contains(needle) {
            return Ok(seen);
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {needle:?}; output: {seen:?}");
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Read until the session reports `SessionClosed`, returning all output
pub async fn read_to_close(
    registry: &SessionRegistry,
    id: SessionId,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();

    loop {
        match registry.read(id).await {
            Ok(data) => seen.extend_from_slice(&data),
            Err(SessionError::SessionClosed(_)) => return Ok(seen),
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            bail!("session {id} still open after {timeout:?}");
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait until the registry holds no open sessions
pub async fn wait_for_empty(registry: &SessionRegistry, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while registry.session_count().await > 0 {
        if Instant::now() >= deadline {
            bail!("{} sessions still open", registry.session_count().await);
        }
        sleep(POLL_INTERVAL).await;
    }
    Ok(())
}
