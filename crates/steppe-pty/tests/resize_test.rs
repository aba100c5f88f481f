//! Window size changes as seen by the child process

use std::time::Duration;
use steppe_pty::{SessionError, SessionRegistry, WindowSize};
use steppe_test_utils::{init_test_logging, read_until, test_config, TestFixtures};

const WAIT: Duration = Duration::from_secs(5);

#[cfg(unix)]
mod unix_tests {
    use super::*;
    use test_case::test_case;

    #[test_case(40, 100 ; "larger")]
    #[test_case(10, 20 ; "smaller")]
    #[test_case(1, 1 ; "minimum")]
    #[test_case(500, 300 ; "huge")]
    #[tokio::test]
    async fn test_child_sees_new_size(rows: u16, cols: u16) {
        init_test_logging();
        let registry = SessionRegistry::new(test_config());
        let id = registry.create().await.unwrap();

        registry.resize(id, rows, cols).await.unwrap();
        assert_eq!(registry.size(id).await.unwrap(), WindowSize::new(rows, cols).unwrap());

        registry.write(id, b"stty size\n").await.unwrap();
        read_until(&registry, id, &format!("{rows} {cols}"), WAIT)
            .await
            .unwrap();

        registry.close(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_size_reaches_child() {
        init_test_logging();
        let registry = SessionRegistry::new(test_config());
        let command = steppe_pty::ShellCommand::new("/bin/sh").args(["-c", "stty size; sleep 30"]);
        let id = registry
            .create_with(command, WindowSize::new(33, 111).unwrap())
            .await
            .unwrap();

        read_until(&registry, id, "33 111", WAIT).await.unwrap();
        registry.close(id).await.unwrap();
    }

    #[test_case(0, 80 ; "zero rows")]
    #[test_case(24, 0 ; "zero cols")]
    #[test_case(0, 0 ; "both zero")]
    #[tokio::test]
    async fn test_invalid_dimensions_keep_previous_size(rows: u16, cols: u16) {
        init_test_logging();
        let registry = SessionRegistry::new(test_config());
        let id = registry.create().await.unwrap();
        registry.resize(id, 30, 90).await.unwrap();

        let err = registry.resize(id, rows, cols).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidDimensions { .. }));
        assert_eq!(registry.size(id).await.unwrap(), WindowSize::new(30, 90).unwrap());

        registry.close(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_sends_sigwinch_only_on_change() {
        init_test_logging();
        let fixtures = TestFixtures::new().unwrap();
        let command = fixtures
            .script_command(
                "winch.sh",
                "trap 'echo WINCH-$(stty size | tr \" \" x)' WINCH\necho READY\nwhile :; do sleep 0.1; done",
            )
            .unwrap();
        let registry = SessionRegistry::new(test_config());
        let id = registry.create_with(command, WindowSize::default()).await.unwrap();
        read_until(&registry, id, "READY", WAIT).await.unwrap();

        // Same size: nothing reaches the child
        registry.resize(id, 24, 80).await.unwrap();
        registry.resize(id, 50, 132).await.unwrap();

        let output = read_until(&registry, id, "WINCH-50x132", WAIT).await.unwrap();
        assert!(!output.contains("WINCH-24x80"), "got {output:?}");

        registry.close(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_after_close_fails() {
        init_test_logging();
        let registry = SessionRegistry::new(test_config());
        let id = registry.create().await.unwrap();
        registry.close(id).await.unwrap();

        let err = registry.resize(id, 30, 90).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed(closed) if closed == id));
        assert!(matches!(registry.size(id).await, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resizes_are_per_session() {
        init_test_logging();
        let registry = SessionRegistry::new(test_config());
        let a = registry.create().await.unwrap();
        let b = registry.create().await.unwrap();

        registry.resize(a, 60, 200).await.unwrap();
        assert_eq!(registry.size(b).await.unwrap(), WindowSize::default());

        registry.close_all().await;
    }
}
