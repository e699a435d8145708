//! User-terminal handling: raw mode with guaranteed restore, window size.

use std::io;
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use nix::pty::Winsize;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::isatty;

/// RAII guard that puts the user's terminal into raw mode (no echo, no line
/// buffering, no driver-level signal keys) and restores the snapshot on
/// drop. A no-op when stdin is not a TTY.
pub struct TerminalGuard {
    saved: Option<Termios>,
}

impl TerminalGuard {
    pub fn new() -> Result<Self> {
        let stdin = io::stdin();
        if !isatty(stdin.as_raw_fd()).unwrap_or(false) {
            return Ok(Self { saved: None });
        }
        let saved = tcgetattr(&stdin).context("tcgetattr on stdin failed")?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("tcsetattr raw mode failed")?;
        Ok(Self { saved: Some(saved) })
    }

    /// Restore now instead of at drop. Used before re-raising a fatal signal
    /// so the shell gets its terminal back first.
    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = tcsetattr(&io::stdin(), SetArg::TCSANOW, &saved) {
                tracing::warn!(error = %e, "failed to restore terminal settings");
                eprintln!("clippy: failed to restore terminal settings: {e}");
            }
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Current user-terminal dimensions, defaulting to 80x24 when stdout is not
/// a terminal or the query fails.
pub fn terminal_size() -> Winsize {
    // SAFETY: zeroed Winsize is valid; ioctl fills it on success and the
    // return value is checked.
    let mut ws: Winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::ioctl(
            io::stdout().as_raw_fd(),
            libc::TIOCGWINSZ as libc::c_ulong,
            &mut ws,
        )
    };
    if ret == -1 || ws.ws_row == 0 || ws.ws_col == 0 {
        ws.ws_row = 24;
        ws.ws_col = 80;
    }
    ws
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_has_sane_fallback() {
        let ws = terminal_size();
        assert!(ws.ws_row > 0);
        assert!(ws.ws_col > 0);
    }

    #[test]
    fn guard_is_noop_without_tty() {
        // Test runners detach stdin from a terminal; the guard must not fail.
        let guard = TerminalGuard::new();
        assert!(guard.is_ok());
    }
}
