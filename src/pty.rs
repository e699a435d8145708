//! PTY allocation and child process management.
//!
//! One fresh master/slave pair per session. The child gets the slave as its
//! controlling terminal with stdio redirected onto it; the wrapper keeps the
//! master and never lets any other process touch it. A dedicated reader
//! thread pumps master output into an mpsc channel so the async wrapper loop
//! can select over it; channel close means the child side is gone.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::thread;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{read, write, Pid};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct PtySession {
    master: OwnedFd,
    child: Mutex<Child>,
    child_pid: u32,
}

impl PtySession {
    /// Open a PTY pair sized to `size` and spawn `command` on the slave as
    /// session leader with the slave as controlling terminal. The child
    /// inherits the wrapper's environment and working directory unchanged.
    pub fn spawn(
        command: &str,
        args: &[String],
        size: Winsize,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty = openpty(&size, None).context("failed to open pty pair")?;
        let master_fd = pty.master.as_raw_fd();
        let slave_fd = pty.slave.as_raw_fd();

        let mut cmd = Command::new(command);
        cmd.args(args);
        // SAFETY: runs in the forked child before exec; only async-signal-safe
        // calls (setsid, ioctl, dup2, close).
        let child = unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                for io_fd in 0..3 {
                    if libc::dup2(slave_fd, io_fd) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                // The child must only hold the slave side; a stray master ref
                // would block EOF and SIGHUP on teardown.
                libc::close(master_fd);
                Ok(())
            })
        }
        .spawn()
        .with_context(|| format!("failed to spawn {command:?}"))?;
        let child_pid = child.id();

        // Parent keeps the master only.
        drop(pty.slave);
        let master = pty.master;

        let reader_fd = master
            .try_clone()
            .context("failed to clone pty master for reading")?;
        let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
        thread::spawn(move || {
            let mut buf = [0u8; 65536];
            loop {
                match read(reader_fd.as_raw_fd(), &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    // EIO: slave side fully closed, the usual Linux EOF.
                    Err(_) => break,
                }
            }
        });

        Ok((
            Self {
                master,
                child: Mutex::new(child),
                child_pid,
            },
            rx,
        ))
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid
    }

    /// Write bytes to the master. User input and broker injections both go
    /// through here, so the child cannot tell them apart.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            match write(self.master.as_fd(), &bytes[written..]) {
                Ok(n) => written += n,
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e).context("write to pty master failed"),
            }
        }
        Ok(())
    }

    pub fn resize(&self, size: Winsize) -> Result<()> {
        // SAFETY: master is a valid open fd for this session's lifetime.
        let ret = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &size,
            )
        };
        if ret == -1 {
            return Err(std::io::Error::last_os_error()).context("TIOCSWINSZ failed");
        }
        Ok(())
    }

    /// Forward a signal to the child's process group. The child called
    /// setsid(), so its pid doubles as the pgid.
    pub fn signal_group(&self, signal: Signal) {
        let pgid = Pid::from_raw(-(self.child_pid as i32));
        if let Err(e) = kill(pgid, signal) {
            tracing::debug!(pid = self.child_pid, %signal, error = %e, "signal forward failed");
        }
    }

    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        self.child
            .lock()
            .try_wait()
            .context("waitpid on child failed")
    }

    pub fn wait(&self) -> Result<ExitStatus> {
        self.child.lock().wait().context("waitpid on child failed")
    }

    /// Escalation used on shutdown timeouts.
    pub fn kill_group(&self) {
        self.signal_group(Signal::SIGKILL);
    }
}
