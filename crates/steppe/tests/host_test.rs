//! Host start-up behaviour that does not need an interactive terminal

use clap::Parser;
use steppe::config::DEFAULT_CONFIG;
use steppe::{Args, HostConfig};
use steppe_test_utils::TestFixtures;

fn args(fixtures: &TestFixtures, flags: &[&str]) -> Args {
    let config = fixtures.path().join("steppe").join("config.toml");
    let mut argv = vec!["steppe".to_string(), "--config".to_string(), config.display().to_string()];
    argv.extend(flags.iter().map(|flag| flag.to_string()));
    Args::try_parse_from(argv).unwrap()
}

#[cfg(unix)]
mod unix_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_shell_fails_before_session_loop() {
        let fixtures = TestFixtures::new().unwrap();
        let args = args(&fixtures, &["--shell", "/nonexistent/steppe-shell"]);

        let err = steppe::run_with(args).await.unwrap_err();
        assert!(err.to_string().contains("Failed to start shell"), "got {err:#}");
    }

    #[tokio::test]
    async fn test_first_run_writes_default_config() {
        let fixtures = TestFixtures::new().unwrap();
        let path = fixtures.path().join("steppe").join("config.toml");
        assert!(!path.exists());

        let args = args(&fixtures, &["--shell", "/nonexistent/steppe-shell"]);
        assert!(steppe::run_with(args).await.is_err());

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, DEFAULT_CONFIG);
        assert_eq!(HostConfig::load_or_create(&path).unwrap(), HostConfig::default());
    }

    #[tokio::test]
    async fn test_existing_config_is_kept_and_used() {
        let fixtures = TestFixtures::new().unwrap();
        let dir = fixtures.path().join("steppe");
        std::fs::create_dir_all(&dir).unwrap();
        let contents = "[shell]\nprogram = \"/nonexistent/configured-shell\"\n";
        std::fs::write(dir.join("config.toml"), contents).unwrap();

        let err = steppe::run_with(args(&fixtures, &[])).await.unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/configured-shell"), "got {err:#}");
        assert_eq!(std::fs::read_to_string(dir.join("config.toml")).unwrap(), contents);

        // The flag wins over the file
        let err = steppe::run_with(args(&fixtures, &["--shell", "/nonexistent/flag-shell"]))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/flag-shell"), "got {err:#}");
    }

    #[tokio::test]
    async fn test_malformed_config_is_reported() {
        let fixtures = TestFixtures::new().unwrap();
        let dir = fixtures.path().join("steppe");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "[session]\nio_timeout_ms = \"soon\"\n").unwrap();

        let err = steppe::run_with(args(&fixtures, &[])).await.unwrap_err();
        assert!(err.to_string().contains("Invalid config file"), "got {err:#}");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        assert!(Args::try_parse_from(["steppe", "--log-level", "loud"]).is_err());
    }
}
