//! Wrapper mode: run one agent under a transparent PTY.
//!
//! Every byte the child writes goes to the user's terminal untouched and,
//! in parallel, into the turn detector. Every byte the user types goes to
//! the PTY master untouched. Completed turns are published to the broker;
//! unsolicited `inject` commands from the broker are written to the master,
//! indistinguishable from typed input.
//!
//! The wrapper must be invisible: no extra environment variables, no bytes
//! of its own on stdout, terminal settings restored on every exit path, and
//! the child's exit disposition (code or signal) propagated exactly.

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::{BrokerClient, ClientError};
use crate::config::WrapConfig;
use crate::detector::{CompletedTurn, TurnDetector};
use crate::protocol::Role;
use crate::pty::PtySession;
use crate::term::{terminal_size, TerminalGuard};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// How the child ended, for the shell's benefit.
#[derive(Debug, Clone, Copy)]
pub struct ExitDisposition {
    pub code: i32,
    pub signal: Option<i32>,
}

impl ExitDisposition {
    fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => Self { code, signal: None },
            (None, Some(sig)) => Self {
                code: 128 + sig,
                signal: Some(sig),
            },
            _ => Self {
                code: 1,
                signal: None,
            },
        }
    }
}

/// Broker-facing side of the session: the persistent connection, plus a
/// single local slot that holds the latest completed turn while the broker
/// is unreachable. The slot is overwritten on each completion and flushed
/// on reconnect.
struct BrokerSession {
    session_id: String,
    child_pid: u32,
    pattern: String,
    client: Option<BrokerClient>,
    pending: Option<CompletedTurn>,
}

impl BrokerSession {
    fn new(session_id: String, child_pid: u32, pattern: String) -> Self {
        Self {
            session_id,
            child_pid,
            pattern,
            client: None,
            pending: None,
        }
    }

    /// Try to connect and register. Returns the inject receiver on a fresh
    /// connection.
    async fn connect(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        match BrokerClient::connect(Role::Wrapper).await {
            Ok(mut client) => {
                match client
                    .register(&self.session_id, self.child_pid, &self.pattern)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(session = %self.session_id, "registered with broker");
                        let injects = client.take_injects();
                        self.client = Some(client);
                        injects
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "broker registration failed");
                        None
                    }
                }
            }
            Err(ClientError::NotRunning) => {
                tracing::debug!("broker not running; turns buffered locally");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "broker connection failed");
                None
            }
        }
    }

    /// Record a completed turn and push it to the broker, reconnecting
    /// opportunistically when the connection is gone.
    async fn publish(&mut self, turn: CompletedTurn) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.pending = Some(turn);
        let mut fresh_injects = None;
        if self.client.is_none() {
            fresh_injects = self.connect().await;
        }
        self.flush().await;
        fresh_injects
    }

    async fn flush(&mut self) {
        let Some(turn) = self.pending.take() else {
            return;
        };
        let Some(client) = self.client.as_ref() else {
            self.pending = Some(turn);
            return;
        };
        match client
            .turn_completed(
                &self.session_id,
                turn.content.clone(),
                turn.interrupted,
                turn.truncated,
            )
            .await
        {
            Ok(turn_id) => {
                tracing::debug!(
                    session = %self.session_id,
                    turn_id = ?turn_id,
                    bytes = turn.content.len(),
                    "turn published"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn publication failed; keeping latest locally");
                self.pending = Some(turn);
                self.client = None;
            }
        }
    }

    async fn deregister(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.deregister(&self.session_id).await;
        }
    }
}

pub async fn run_wrap(cfg: WrapConfig) -> Result<ExitDisposition> {
    let pattern = cfg.compiled_pattern()?;
    let session_id = Uuid::new_v4().to_string();

    let (pty, mut pty_rx) = PtySession::spawn(&cfg.command, &cfg.args, terminal_size())
        .with_context(|| format!("failed to start {:?} under a pty", cfg.command))?;
    let mut guard = TerminalGuard::new().context("failed to enter raw mode")?;

    let mut detector = TurnDetector::new(pattern, cfg.turn_cap_bytes);

    // Broker traffic lives on its own task so the user-visible output path
    // is never gated by broker I/O: the main loop hands completed turns to
    // this task and receives inject bytes from it, both over channels.
    let (turn_tx, mut turn_rx) = mpsc::unbounded_channel::<CompletedTurn>();
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let broker_task = {
        let mut session = BrokerSession::new(session_id, pty.child_pid(), cfg.pattern_source());
        tokio::spawn(async move {
            let mut conn_injects = session.connect().await;
            loop {
                tokio::select! {
                    turn = turn_rx.recv() => match turn {
                        Some(turn) => {
                            if let Some(fresh) = session.publish(turn).await {
                                conn_injects = Some(fresh);
                            }
                        }
                        None => break,
                    },
                    bytes = recv_inject(&mut conn_injects) => {
                        if inject_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                }
            }
            session.deregister().await;
        })
    };

    // Stdin pump: a blocking reader thread, since the user's terminal has no
    // useful async interface and the loop must never block on it.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });

    let mut sigwinch = signal(SignalKind::window_change()).context("SIGWINCH handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("SIGHUP handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("SIGQUIT handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("SIGUSR1 handler")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).context("SIGUSR2 handler")?;
    let mut sigtstp =
        signal(SignalKind::from_raw(libc::SIGTSTP)).context("SIGTSTP handler")?;
    let mut sigcont =
        signal(SignalKind::from_raw(libc::SIGCONT)).context("SIGCONT handler")?;

    let mut stdout = tokio::io::stdout();
    let mut reap_tick = tokio::time::interval(REAP_INTERVAL);
    reap_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut status: Option<ExitStatus> = None;
    let mut stdin_open = true;
    let mut injects_open = true;

    loop {
        tokio::select! {
            // Child output: user terminal first, detector second; the
            // detector never gates the passthrough write.
            chunk = pty_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        stdout.write_all(&chunk).await.context("write to user terminal failed")?;
                        stdout.flush().await.context("flush to user terminal failed")?;
                        for turn in detector.feed(&chunk) {
                            let _ = turn_tx.send(turn);
                        }
                    }
                    None => break,
                }
            }

            // User input passthrough.
            data = stdin_rx.recv(), if stdin_open => {
                match data {
                    Some(data) => {
                        // Noted before the write: the child's echo of these
                        // bytes can only arrive afterwards, and the detector
                        // skips it at the window start.
                        detector.note_input(&data);
                        // EIO here just means the child is already gone; the
                        // reap tick will pick that up.
                        if let Err(e) = pty.write_all(&data) {
                            tracing::debug!(error = %e, "input write failed");
                        }
                    }
                    // Stdin EOF: the user's terminal is gone; keep serving
                    // the child until it exits.
                    None => stdin_open = false,
                }
            }

            // Broker-initiated injection, written promptly and unmodified.
            bytes = inject_rx.recv(), if injects_open => {
                match bytes {
                    Some(bytes) => {
                        detector.note_input(&bytes);
                        if let Err(e) = pty.write_all(&bytes) {
                            tracing::warn!(error = %e, "inject write failed");
                        }
                    }
                    None => injects_open = false,
                }
            }

            _ = sigwinch.recv() => {
                // The kernel delivers SIGWINCH to the child as a consequence
                // of the resize; no forwarding.
                if let Err(e) = pty.resize(terminal_size()) {
                    tracing::warn!(error = %e, "pty resize failed");
                }
            }
            _ = sigint.recv() => pty.signal_group(Signal::SIGINT),
            _ = sigquit.recv() => pty.signal_group(Signal::SIGQUIT),
            _ = sighup.recv() => pty.signal_group(Signal::SIGHUP),
            _ = sigusr1.recv() => pty.signal_group(Signal::SIGUSR1),
            _ = sigusr2.recv() => pty.signal_group(Signal::SIGUSR2),
            _ = sigterm.recv() => {
                // Graceful shutdown: hand the signal to the child and keep
                // mediating until it exits.
                pty.signal_group(Signal::SIGTERM);
            }
            _ = sigtstp.recv() => {
                pty.signal_group(Signal::SIGTSTP);
                suspend_self();
            }
            _ = sigcont.recv() => pty.signal_group(Signal::SIGCONT),

            _ = reap_tick.tick() => {
                if let Ok(Some(st)) = pty.try_wait() {
                    status = Some(st);
                    break;
                }
            }
        }
    }

    // Draining: the child is gone (or going); read residual output until the
    // master hits EOF, but never wait forever.
    let drain = async {
        while let Some(chunk) = pty_rx.recv().await {
            let _ = stdout.write_all(&chunk).await;
            let _ = stdout.flush().await;
            for turn in detector.feed(&chunk) {
                let _ = turn_tx.send(turn);
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!("drain timed out with output still pending");
    }

    let status = match status {
        Some(status) => status,
        None => pty.wait().context("failed to reap child")?,
    };

    // Closing the turn channel lets the broker task deregister and finish.
    drop(turn_tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), broker_task).await;
    guard.restore();

    Ok(ExitDisposition::from_status(status))
}

async fn recv_inject(rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Vec<u8> {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(bytes) => bytes,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Stop ourselves after forwarding SIGTSTP; SIGCONT resumes both processes.
fn suspend_self() {
    if let Err(e) = nix::sys::signal::raise(Signal::SIGSTOP) {
        tracing::warn!(error = %e, "failed to suspend wrapper");
    }
}

/// Re-raise the child's fatal signal with default disposition so the parent
/// shell observes the same death we did. Falls back to a plain exit code.
pub fn exit_like_child(disposition: ExitDisposition) -> ! {
    if let Some(sig) = disposition.signal {
        // SAFETY: resetting a handler and re-raising is the standard way to
        // propagate a fatal signal after cleanup.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
    std::process::exit(disposition.code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DEFAULT_TURN_CAP_BYTES;
    use regex::bytes::Regex;

    #[test]
    fn input_noting_precedes_echo_as_in_the_loop() {
        // Mirrors the event loop's ordering: the whole line is noted when it
        // is written to the master, and the child's echo of it arrives
        // afterwards through the output path.
        let mut d = TurnDetector::new(Regex::new("^> $").unwrap(), DEFAULT_TURN_CAP_BYTES);
        d.feed(b"> ");
        assert!(d.ready());

        d.note_input(b"hello\r");
        let turns = d.feed(b"hello\r\nworld\n> ");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, b"world\n");

        d.note_input(b"next\r");
        d.note_input(&[0x03]);
        let turns = d.feed(b"next\r\npartial\n> ");
        assert!(turns[0].interrupted);
        assert_eq!(turns[0].content, b"partial\n");
    }

    #[test]
    fn disposition_from_plain_exit() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(0x0300); // exit code 3
        let d = ExitDisposition::from_status(status);
        assert_eq!(d.code, 3);
        assert_eq!(d.signal, None);
    }

    #[test]
    fn disposition_from_signal_death() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(libc::SIGTERM); // killed by SIGTERM
        let d = ExitDisposition::from_status(status);
        assert_eq!(d.signal, Some(libc::SIGTERM));
        assert_eq!(d.code, 128 + libc::SIGTERM);
    }
}
