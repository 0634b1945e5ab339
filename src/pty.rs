//! PTY pair creation and shell spawning for the session daemon.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd};
use thiserror::Error;

use crate::registry::SESSION_ENV;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork shell: {0}")]
    Fork(#[source] nix::Error),

    #[error("invalid shell path: {0}")]
    InvalidShell(#[source] std::ffi::NulError),

    #[error("failed to set window size: {0}")]
    Resize(#[source] nix::Error),

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] nix::Error),
}

/// A PTY pair owned by the daemon.
///
/// The shell child holds the slave as its controlling terminal; the daemon
/// keeps both ends open so a resize can be applied to each.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Open a new PTY pair with the master in non-blocking mode.
pub fn open_pair() -> Result<PtyPair, PtyError> {
    let OpenptyResult { master, slave } = openpty(None, None).map_err(PtyError::OpenPty)?;

    let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
    let mut flags = OFlag::from_bits_retain(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;

    Ok(PtyPair { master, slave })
}

/// Fork the shell with the PTY slave bound to stdin/stdout/stderr.
///
/// The child runs in its own session with the slave as controlling
/// terminal and `SESS_NUM=<session>` exported, so every process inside the
/// session can tell it is nested. Returns the child PID.
pub fn spawn_shell(pair: &PtyPair, shell: &str, session_num: &str) -> Result<Pid, PtyError> {
    let prog = CString::new(shell).map_err(PtyError::InvalidShell)?;
    let argv = [prog.clone()];

    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let master_fd = pair.master.as_raw_fd();
            let slave_fd = pair.slave.as_raw_fd();

            // The child only needs the slave end.
            unsafe {
                libc::close(master_fd);
            }

            if setsid().is_err() {
                std::process::exit(1);
            }

            // Take the slave as controlling terminal.
            unsafe {
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                    std::process::exit(1);
                }
                if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
                    || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
                    || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
                {
                    std::process::exit(1);
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
            }

            // Single-threaded child between fork and exec; mutating the
            // environment is fine here.
            std::env::set_var(SESSION_ENV, session_num);

            let _ = execvp(&prog, &argv);

            // execvp only returns on error.
            std::process::exit(127);
        }
    }
}

/// Apply a window size to one end of the PTY (or any terminal fd).
pub fn set_winsize<F: AsRawFd>(fd: &F, rows: u16, cols: u16) -> Result<(), PtyError> {
    let ws = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // TIOCSWINSZ ioctl
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
    if ret < 0 {
        return Err(PtyError::Resize(nix::Error::last()));
    }
    Ok(())
}

/// Query the window size of a terminal fd.
#[must_use]
pub fn get_winsize<F: AsRawFd>(fd: &F) -> Option<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
        Some((ws.ws_row, ws.ws_col))
    } else {
        None
    }
}

/// Check if the shell child has exited without blocking.
/// Returns `Some(exit_code)` if exited, None if still running.
pub fn try_wait(pid: Pid) -> Result<Option<i32>, PtyError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
        WaitStatus::Exited(_, code) => Ok(Some(code)),
        WaitStatus::Signaled(_, sig, _) => Ok(Some(128 + sig as i32)),
        // All other states (StillAlive, Stopped, Continued, etc.) mean not exited yet
        _ => Ok(None),
    }
}

/// Send a signal to the shell child.
pub fn signal_child(pid: Pid, sig: Signal) -> Result<(), PtyError> {
    signal::kill(pid, sig).map_err(PtyError::Signal)
}

/// Deliver SIGWINCH to the shell's process group so interactive programs
/// repaint at the new size.
pub fn notify_winch(pid: Pid) {
    let _ = signal::kill(Pid::from_raw(-pid.as_raw()), Signal::SIGWINCH);
}
