//! Terminal dimensions and the resize controller

use crate::SessionError;
use nix::pty::Winsize;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Terminal dimensions. Both sides are non-zero by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    rows: u16,
    cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Result<Self, SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::InvalidDimensions { rows, cols });
        }
        Ok(Self { rows, cols })
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub(crate) fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Apply `size` to the PTY behind `fd`. The kernel sends `SIGWINCH` to the
/// foreground process group when the size actually changes.
pub fn set_window_size(fd: &impl AsRawFd, size: WindowSize) -> io::Result<()> {
    let winsize = size.to_winsize();
    // SAFETY: TIOCSWINSZ reads a `winsize` struct through the pointer, which
    // outlives the call.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize as *const Winsize) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read the window size the kernel currently reports for the PTY behind `fd`.
pub fn query_window_size(fd: &impl AsRawFd) -> io::Result<WindowSize> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a `winsize` struct through the pointer.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut winsize as *mut Winsize) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    WindowSize::new(winsize.ws_row, winsize.ws_col).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "PTY reports a zero window size")
    })
}

/// Tracks a session's dimensions and applies changes to its PTY.
///
/// The recorded size only moves after the ioctl succeeds, so it always
/// matches the last applied resize. Callers serialize `apply` (the session's
/// I/O lock); reading the current size does not wait on that lock.
#[derive(Debug)]
pub struct ResizeController {
    current: Mutex<WindowSize>,
}

impl ResizeController {
    pub fn new(initial: WindowSize) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// The last successfully applied size
    pub fn current(&self) -> WindowSize {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `requested` to the PTY behind `fd`.
    ///
    /// Returns `false` without touching the PTY when the size is unchanged, so
    /// the child is not sent a redundant `SIGWINCH`.
    pub fn apply(&self, fd: &impl AsRawFd, requested: WindowSize) -> io::Result<bool> {
        if self.current() == requested {
            return Ok(false);
        }
        set_window_size(fd, requested)?;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = requested;
        debug!(rows = requested.rows, cols = requested.cols, "resized PTY window");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::Pty;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(0, 80 ; "zero rows")]
    #[test_case(24, 0 ; "zero cols")]
    #[test_case(0, 0 ; "both zero")]
    fn test_rejects_zero_dimensions(rows: u16, cols: u16) {
        let err = WindowSize::new(rows, cols).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidDimensions { rows: r, cols: c } if r == rows && c == cols
        ));
    }

    #[test]
    fn test_default_size() {
        let size = WindowSize::default();
        assert_eq!((size.rows(), size.cols()), (24, 80));
        assert_eq!(size.to_string(), "80x24");
    }

    #[test]
    fn test_controller_skips_unchanged_size() {
        let pty = Pty::new(WindowSize::default()).unwrap();
        let controller = ResizeController::new(WindowSize::default());

        assert!(!controller.apply(&pty, WindowSize::default()).unwrap());
        assert_eq!(controller.current(), WindowSize::default());

        let bigger = WindowSize::new(50, 132).unwrap();
        assert!(controller.apply(&pty, bigger).unwrap());
        assert_eq!(controller.current(), bigger);
        assert_eq!(pty.window_size().unwrap(), bigger);
    }

    #[test]
    fn test_failed_apply_keeps_previous_size() {
        let controller = ResizeController::new(WindowSize::default());
        let not_a_tty = std::fs::File::open("/dev/null").unwrap();

        let result = controller.apply(&not_a_tty, WindowSize::new(10, 10).unwrap());
        assert!(result.is_err());
        assert_eq!(controller.current(), WindowSize::default());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_valid_sizes_round_trip_through_pty(rows in 1u16..=500, cols in 1u16..=500) {
            let pty = Pty::new(WindowSize::default()).unwrap();
            let controller = ResizeController::new(WindowSize::default());
            let requested = WindowSize::new(rows, cols).unwrap();

            controller.apply(&pty, requested).unwrap();
            prop_assert_eq!(controller.current(), requested);
            prop_assert_eq!(pty.window_size().unwrap(), requested);
        }

        #[test]
        fn prop_zero_dimension_always_rejected(n in any::<u16>()) {
            prop_assert!(WindowSize::new(0, n).is_err());
            prop_assert!(WindowSize::new(n, 0).is_err());
        }
    }
}
