//! Logging to a file. Kept in its own test binary: the first logger
//! installed in a process stays for its lifetime.

use clap::Parser;
use steppe::Args;
use steppe_test_utils::TestFixtures;

#[cfg(unix)]
mod unix_tests {
    use super::*;

    #[tokio::test]
    async fn test_log_file_records_startup_failure() {
        let fixtures = TestFixtures::new().unwrap();
        let config_path = fixtures.path().join("config.toml");
        let log_path = fixtures.path().join("steppe.log");
        let args = Args::try_parse_from([
            "steppe",
            "--config",
            config_path.to_str().unwrap(),
            "--shell",
            "/nonexistent/steppe-shell",
            "--log-file",
            log_path.to_str().unwrap(),
        ])
        .unwrap();

        assert!(steppe::run_with(args).await.is_err());

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("failed to create session"), "log was {log:?}");
        assert!(!log.contains('\x1b'), "log file must not contain ANSI escapes");
    }
}
