//! The attach client: bridges the invoking terminal to a session daemon.
//!
//! Puts stdin into raw non-blocking mode, pumps bytes both ways, reacts
//! to SIGWINCH with `RESIZE` frames and to SIGUSR1 with a detach, and
//! restores the terminal on every exit path.

#![allow(unsafe_code)] // terminal manipulation and raw-fd reads

use crate::protocol;
use crate::pty;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{
    self, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
};
use std::io::Write as _;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const STDIN_RETRY: Duration = Duration::from_millis(10);
const STDIN_EOF_SLEEP: Duration = Duration::from_millis(20);

/// Ctrl-X detaches when it arrives alone as a single-byte read.
const DETACH_BYTE: u8 = 0x18;

/// Errors during attach.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to connect to session: {0}")]
    Connect(#[source] std::io::Error),

    #[error("timed out connecting to session")]
    ConnectTimeout,

    #[error("failed to read initial response: {0}")]
    Greeting(#[source] std::io::Error),

    #[error("timed out waiting for session greeting")]
    GreetingTimeout,

    #[error("unexpected response: {0}")]
    Rejected(String),

    #[error("stdin is not a terminal")]
    NotATty,

    #[error("failed to get terminal attributes: {0}")]
    GetTermios(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetTermios(#[source] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for one attachment.
pub struct AttachConfig {
    pub session_num: String,
    pub socket_path: PathBuf,
    /// When set, Ctrl-X passes through to the shell instead of detaching.
    pub disable_ctrl_x: bool,
}

/// Saved terminal state; restored explicitly on the normal path and by
/// Drop on every other one.
struct RawGuard {
    original: Termios,
    stdin: OwnedFd,
    restored: bool,
}

impl RawGuard {
    /// Require a terminal on stdin, save its mode, switch to raw, and make
    /// stdin non-blocking so a signal-triggered detach never waits for a
    /// keystroke.
    fn enter() -> Result<Self, AttachError> {
        let stdin = std::io::stdin();
        let fd = stdin.as_fd();

        if !nix::unistd::isatty(fd).unwrap_or(false) {
            return Err(AttachError::NotATty);
        }

        let original = termios::tcgetattr(fd).map_err(AttachError::GetTermios)?;

        let mut raw = original.clone();
        raw.input_flags.remove(
            InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::IXON,
        );
        raw.output_flags.remove(OutputFlags::OPOST);
        raw.local_flags.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN,
        );
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(fd, SetArg::TCSAFLUSH, &raw).map_err(AttachError::SetTermios)?;

        let stdin_owned = fd.try_clone_to_owned().map_err(AttachError::Io)?;
        set_nonblocking(&stdin_owned, true);

        Ok(Self {
            original,
            stdin: stdin_owned,
            restored: false,
        })
    }

    /// Restore the original mode and blocking stdin. Idempotent.
    fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Err(e) = termios::tcsetattr(&self.stdin, SetArg::TCSAFLUSH, &self.original) {
            eprintln!("Warning: failed to restore terminal: {e}");
        }
        set_nonblocking(&self.stdin, false);
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

fn set_nonblocking(fd: &OwnedFd, nonblocking: bool) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let mut flags = OFlag::from_bits_retain(flags);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
    }
}

/// Window size of the invoking terminal, if stdin is one.
#[must_use]
pub fn terminal_size() -> Option<(u16, u16)> {
    pty::get_winsize(&std::io::stdin())
}

/// Attach the invoking terminal to a session daemon.
///
/// Returns once the client detaches (Ctrl-X, SIGUSR1, or signal-driven
/// shutdown) or the connection drops. The terminal is restored before
/// this returns, on every path.
pub async fn attach(config: AttachConfig) -> Result<(), AttachError> {
    let stream = match timeout(CONNECT_TIMEOUT, UnixStream::connect(&config.socket_path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(AttachError::Connect(e)),
        Err(_) => return Err(AttachError::ConnectTimeout),
    };

    let (mut reader, writer) = stream.into_split();

    let mut greeting = [0u8; 256];
    let n = match timeout(CONNECT_TIMEOUT, reader.read(&mut greeting)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(AttachError::Greeting(e)),
        Err(_) => return Err(AttachError::GreetingTimeout),
    };
    if &greeting[..n] != protocol::READY {
        return Err(AttachError::Rejected(
            String::from_utf8_lossy(&greeting[..n]).trim_end().to_string(),
        ));
    }

    let mut guard = RawGuard::enter()?;

    print!("Attaching to session {}\r\n", config.session_num);
    let _ = std::io::stdout().flush();

    let writer = Arc::new(Mutex::new(writer));

    // The PTY should match our window before the first keystroke.
    send_current_size(&writer).await;

    let (shutdown, _) = broadcast::channel::<()>(1);

    // Subscribe before spawning so no task can miss the latch.
    let signals = tokio::spawn(signal_task(
        Arc::clone(&writer),
        shutdown.clone(),
        shutdown.subscribe(),
    ));
    let sock = tokio::spawn(socket_pump(
        reader,
        shutdown.clone(),
        shutdown.subscribe(),
    ));
    let stdin_task = tokio::spawn(stdin_pump(
        Arc::clone(&writer),
        shutdown.clone(),
        shutdown.subscribe(),
        config.disable_ctrl_x,
    ));

    let _ = tokio::join!(sock, stdin_task);
    let _ = shutdown.send(());
    let _ = signals.await;

    guard.restore();
    print!("\r\nDetached from session {}\r\n", config.session_num);
    let _ = std::io::stdout().flush();

    Ok(())
}

/// Forward session output to stdout until the connection drops or the
/// latch fires.
async fn socket_pump(
    mut reader: OwnedReadHalf,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::select! {
            r = timeout(SOCKET_READ_TIMEOUT, reader.read(&mut buf)) => r,
            _ = shutdown_rx.recv() => return,
        };
        match read {
            // Deadline; poll again.
            Err(_) => continue,
            Ok(Ok(0)) => {
                debug!("session closed the connection");
                let _ = shutdown.send(());
                return;
            }
            Ok(Ok(n)) => {
                if stdout.write_all(&buf[..n]).await.is_err() || stdout.flush().await.is_err() {
                    let _ = shutdown.send(());
                    return;
                }
            }
            Ok(Err(e)) => {
                debug!("session read error: {e}");
                let _ = shutdown.send(());
                return;
            }
        }
    }
}

/// Forward keystrokes to the session. Stdin is non-blocking, so the latch
/// is observed within one retry interval even with no input pending.
async fn stdin_pump(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    disable_ctrl_x: bool,
) {
    let mut buf = [0u8; 1024];

    loop {
        match shutdown_rx.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => return,
        }

        // SAFETY: stdin stays open for the life of the process.
        let fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        match nix::unistd::read(fd, &mut buf) {
            // No input ready.
            Err(Errno::EAGAIN) => tokio::time::sleep(STDIN_RETRY).await,
            // Interrupted by a signal (e.g. SIGWINCH); retry.
            Err(Errno::EINTR) => {}
            // Stdin closed; the attachment stays alive.
            Ok(0) => tokio::time::sleep(STDIN_EOF_SLEEP).await,
            Ok(n) => {
                if !disable_ctrl_x && n == 1 && buf[0] == DETACH_BYTE {
                    detach(&writer, &shutdown).await;
                    return;
                }
                if send(&writer, &buf[..n]).await.is_err() {
                    let _ = shutdown.send(());
                    return;
                }
            }
            Err(e) => {
                debug!("stdin read error: {e}");
                let _ = shutdown.send(());
                return;
            }
        }
    }
}

/// SIGINT/SIGTERM close, SIGWINCH resizes, SIGUSR1 detaches.
async fn signal_task(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut int, mut term, mut winch, mut usr1) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::window_change()),
        signal(SignalKind::user_defined1()),
    ) {
        (Ok(int), Ok(term), Ok(winch), Ok(usr1)) => (int, term, winch, usr1),
        _ => {
            warn!("failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = int.recv() => {
                let _ = shutdown.send(());
                return;
            }
            _ = term.recv() => {
                let _ = shutdown.send(());
                return;
            }
            _ = winch.recv() => send_current_size(&writer).await,
            _ = usr1.recv() => {
                debug!("got SIGUSR1; detaching");
                detach(&writer, &shutdown).await;
                return;
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}

/// Send `DISCONNECT` as a lone write (the daemon's classifier needs the
/// frame unbatched), then fire the latch.
async fn detach(writer: &Arc<Mutex<OwnedWriteHalf>>, shutdown: &broadcast::Sender<()>) {
    let _ = send(writer, protocol::DISCONNECT).await;
    let _ = shutdown.send(());
}

async fn send_current_size(writer: &Arc<Mutex<OwnedWriteHalf>>) {
    if let Some((rows, cols)) = terminal_size() {
        debug!(rows, cols, "sending resize");
        let _ = send(writer, &protocol::resize_frame(rows, cols)).await;
    }
}

async fn send(writer: &Mutex<OwnedWriteHalf>, data: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    match timeout(WRITE_TIMEOUT, writer.write_all(data)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socket write timed out",
        )),
    }
}
