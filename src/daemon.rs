//! The per-session daemon: PTY owner, shell parent, socket server.
//!
//! One daemon supervises exactly one session. The launcher forks it with
//! `--daemon`; it detaches from the terminal once its socket is ready and
//! runs until the shell exits or it is told to terminate. At most one
//! client may be attached at a time, enforced where a connection is
//! accepted rather than at broadcast time.

use crate::protocol::{self, Frame};
use crate::pty::{self, PtyPair};
use crate::registry::{self, Session};
use chrono::Local;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const PTY_POLL: Duration = Duration::from_millis(10);
const SHELL_KILL_GRACE: Duration = Duration::from_secs(1);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to open PTY: {0}")]
    Pty(#[from] pty::PtyError),

    #[error("failed to write session metadata: {0}")]
    Metadata(#[source] registry::RegistryError),

    #[error("failed to bind session socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to detach from terminal: {0}")]
    Detach(#[source] std::io::Error),
}

/// One session's supervisor.
pub struct Daemon {
    session_num: String,
    socket_path: PathBuf,
    meta_path: PathBuf,
}

/// State shared between the daemon's tasks.
///
/// The PTY fds live here as raw descriptors; the owning [`PtyPair`] stays
/// in [`Daemon::run`] and outlives every task.
struct Shared {
    session_num: String,
    master_fd: RawFd,
    slave_fd: RawFd,
    shell_pid: Pid,
    /// At most one entry; the invariant is enforced at the accept site.
    clients: RwLock<HashMap<u64, Arc<ClientHandle>>>,
    shutdown: broadcast::Sender<()>,
}

struct ClientHandle {
    writer: Mutex<OwnedWriteHalf>,
    last_activity: std::sync::Mutex<Instant>,
}

impl Daemon {
    #[must_use]
    pub fn new(session_num: String, socket_path: PathBuf, meta_path: PathBuf) -> Self {
        Self {
            session_num,
            socket_path,
            meta_path,
        }
    }

    /// Start the session and serve until the shell exits or a terminate
    /// signal arrives. Startup failures unwind whatever was already
    /// acquired; they are reported on stderr, which still points at the
    /// launcher's terminal until the detach step.
    pub async fn run(self, shell: &str, initial_rows: u16, initial_cols: u16) -> Result<(), DaemonError> {
        let pair = pty::open_pair()?;

        if initial_rows > 0 && initial_cols > 0 {
            let _ = pty::set_winsize(&pair.slave, initial_rows, initial_cols);
        }

        let shell_pid = pty::spawn_shell(&pair, shell, &self.session_num)?;
        info!(session = %self.session_num, pid = shell_pid.as_raw(), %shell, "started shell");

        if let Err(e) = self.write_metadata(shell, shell_pid) {
            unwind_shell(shell_pid).await;
            return Err(DaemonError::Metadata(e));
        }

        let listener = match self.bind_listener() {
            Ok(listener) => listener,
            Err(e) => {
                unwind_shell(shell_pid).await;
                let _ = std::fs::remove_file(&self.meta_path);
                return Err(e);
            }
        };

        if let Err(e) = detach_from_terminal() {
            unwind_shell(shell_pid).await;
            let _ = std::fs::remove_file(&self.meta_path);
            let _ = std::fs::remove_file(&self.socket_path);
            return Err(DaemonError::Detach(e));
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            session_num: self.session_num.clone(),
            master_fd: pair.master.as_raw_fd(),
            slave_fd: pair.slave.as_raw_fd(),
            shell_pid,
            clients: RwLock::new(HashMap::new()),
            shutdown: shutdown_tx,
        });

        // Subscribe before spawning so no task can miss the latch.
        let signals = tokio::spawn(signal_task(Arc::clone(&shared), shared.shutdown.subscribe()));
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            shared.shutdown.subscribe(),
        ));
        let output = tokio::spawn(pty_output_loop(
            Arc::clone(&shared),
            shared.shutdown.subscribe(),
        ));
        let monitor = tokio::spawn(client_monitor(
            Arc::clone(&shared),
            shared.shutdown.subscribe(),
        ));

        let _ = shutdown_rx.recv().await;
        info!(session = %self.session_num, "shutting down");

        // Every task observes the latch at its next deadline; collect them
        // before tearing the PTY down.
        let _ = tokio::join!(signals, accept, output, monitor);

        self.cleanup(&shared, pair).await;
        Ok(())
    }

    fn write_metadata(&self, shell: &str, shell_pid: Pid) -> Result<(), registry::RegistryError> {
        let meta = Session {
            number: self.session_num.clone(),
            created_at: Local::now(),
            pid: shell_pid.as_raw(),
            command: shell.to_string(),
        };
        meta.write_atomic(&self.meta_path)
    }

    fn bind_listener(&self) -> Result<UnixListener, DaemonError> {
        // Security: check for a symlink attack before removing a stale
        // socket left by a crashed daemon.
        match std::fs::symlink_metadata(&self.socket_path) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(DaemonError::Bind(std::io::Error::other(
                        "socket path is a symlink - possible security attack",
                    )));
                }
                // Only remove if it's a socket (or we can't tell).
                if metadata.file_type().is_socket() || metadata.file_type().is_file() {
                    let _ = std::fs::remove_file(&self.socket_path);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DaemonError::Bind(e)),
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(DaemonError::Bind)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(DaemonError::Bind)?;
        Ok(listener)
    }

    async fn cleanup(&self, shared: &Shared, pair: PtyPair) {
        shared.clients.write().await.clear();

        let _ = pty::signal_child(shared.shell_pid, Signal::SIGTERM);
        tokio::time::sleep(SHELL_KILL_GRACE).await;
        match pty::try_wait(shared.shell_pid) {
            Ok(Some(_)) => {}
            _ => {
                let _ = pty::signal_child(shared.shell_pid, Signal::SIGKILL);
                let _ = pty::try_wait(shared.shell_pid);
            }
        }

        drop(pair);

        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.meta_path);
        if let Some(dir) = self.meta_path.parent() {
            let _ = std::fs::remove_file(dir.join(registry::CURRENT_FILE));
        }
        info!(session = %self.session_num, "session closed");
    }
}

/// TERM the shell and escalate to KILL; used when startup fails after the
/// shell was already forked.
async fn unwind_shell(pid: Pid) {
    let _ = pty::signal_child(pid, Signal::SIGTERM);
    tokio::time::sleep(SHELL_KILL_GRACE).await;
    if !matches!(pty::try_wait(pid), Ok(Some(_))) {
        let _ = pty::signal_child(pid, Signal::SIGKILL);
        let _ = pty::try_wait(pid);
    }
}

/// Become a session leader (best effort) and point the standard
/// descriptors at the null device. From here on the daemon is silent.
fn detach_from_terminal() -> std::io::Result<()> {
    // Fails with EPERM when already a leader; that is fine.
    let _ = nix::unistd::setsid();

    let dev_null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = dev_null.as_raw_fd();
    // SAFETY: dup2 onto the standard descriptors; dev_null stays open
    // until we return.
    #[allow(unsafe_code)]
    unsafe {
        if libc::dup2(fd, libc::STDIN_FILENO) < 0
            || libc::dup2(fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(fd, libc::STDERR_FILENO) < 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Translate SIGCHLD/SIGTERM/SIGINT into the shutdown latch.
async fn signal_task(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut child, mut term, mut int) = match (
        signal(SignalKind::child()),
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(child), Ok(term), Ok(int)) => (child, term, int),
        _ => {
            warn!("failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = child.recv() => {
                if let Ok(Some(code)) = pty::try_wait(shared.shell_pid) {
                    info!(code, "shell exited");
                    let _ = shared.shutdown.send(());
                    return;
                }
            }
            _ = term.recv() => {
                let _ = shared.shutdown.send(());
                return;
            }
            _ = int.recv() => {
                let _ = shared.shutdown.send(());
                return;
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Accept connections and enforce the single-client invariant.
async fn accept_loop(
    listener: UnixListener,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => handle_new_connection(stream, &shared).await,
                    Err(e) => warn!("accept error: {e}"),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

async fn handle_new_connection(stream: UnixStream, shared: &Arc<Shared>) {
    let (reader, mut writer) = stream.into_split();

    let mut clients = shared.clients.write().await;
    if !clients.is_empty() {
        let _ = timeout(CLIENT_WRITE_TIMEOUT, writer.write_all(protocol::BUSY)).await;
        return;
    }

    match timeout(CLIENT_WRITE_TIMEOUT, writer.write_all(protocol::READY)).await {
        Ok(Ok(())) => {}
        _ => return,
    }

    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    clients.insert(
        id,
        Arc::new(ClientHandle {
            writer: Mutex::new(writer),
            last_activity: std::sync::Mutex::new(Instant::now()),
        }),
    );
    drop(clients);

    debug!(client = id, "client connected; sent READY");
    tokio::spawn(connection_reader(
        id,
        reader,
        Arc::clone(shared),
        shared.shutdown.subscribe(),
    ));
}

/// Per-connection reader: classifies each whole read chunk and dispatches
/// it. Control frames arrive as isolated writes (the client guarantees
/// this), so no streaming decoder is needed.
async fn connection_reader(
    id: u64,
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::select! {
            r = timeout(CLIENT_READ_TIMEOUT, reader.read(&mut buf)) => r,
            _ = shutdown.recv() => return,
        };

        let n = match read {
            // Deadline expired; bail out if we were removed meanwhile.
            Err(_) => {
                if !shared.clients.read().await.contains_key(&id) {
                    return;
                }
                continue;
            }
            Ok(Ok(0)) | Ok(Err(_)) => {
                remove_client(&shared, id).await;
                return;
            }
            Ok(Ok(n)) => n,
        };

        touch_client(&shared, id).await;

        match protocol::classify(&buf[..n]) {
            Frame::Disconnect => {
                debug!(client = id, "client disconnected");
                remove_client(&shared, id).await;
                return;
            }
            Frame::Ping => {
                let handle = shared.clients.read().await.get(&id).cloned();
                if let Some(handle) = handle {
                    let mut writer = handle.writer.lock().await;
                    let _ = timeout(CLIENT_WRITE_TIMEOUT, writer.write_all(protocol::PONG)).await;
                }
            }
            Frame::Resize { rows, cols } => apply_resize(&shared, rows, cols),
            Frame::Data(data) => {
                // SAFETY: the master fd outlives every connection task.
                #[allow(unsafe_code)]
                let fd = unsafe { BorrowedFd::borrow_raw(shared.master_fd) };
                if let Err(e) = write_all_fd(fd, data) {
                    warn!("PTY write failed: {e}");
                }
            }
        }
    }
}

/// Apply a window size to both PTY ends, wake the shell's process group
/// with SIGWINCH, and verify by reading the slave size back.
fn apply_resize(shared: &Shared, rows: u16, cols: u16) {
    // SAFETY: the PTY fds outlive every connection task.
    #[allow(unsafe_code)]
    let slave = unsafe { BorrowedFd::borrow_raw(shared.slave_fd) };
    #[allow(unsafe_code)]
    let master = unsafe { BorrowedFd::borrow_raw(shared.master_fd) };

    let _ = pty::set_winsize(&slave, rows, cols);
    let _ = pty::set_winsize(&master, rows, cols);
    pty::notify_winch(shared.shell_pid);

    if let Some((got_rows, got_cols)) = pty::get_winsize(&slave) {
        debug!(
            req_rows = rows,
            req_cols = cols,
            got_rows,
            got_cols,
            "applied resize"
        );
    }
}

/// Read PTY output and broadcast it to the attached client.
async fn pty_output_loop(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let mut buf = [0u8; 4096];

    loop {
        match shutdown.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => return,
        }

        // SAFETY: the master fd outlives this task.
        #[allow(unsafe_code)]
        let fd = unsafe { BorrowedFd::borrow_raw(shared.master_fd) };
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => {
                debug!("PTY master closed");
                return;
            }
            Ok(n) => broadcast_output(&shared, &buf[..n]).await,
            // No data yet; the master is non-blocking.
            Err(nix::Error::EAGAIN) => tokio::time::sleep(PTY_POLL).await,
            Err(nix::Error::EINTR) => {}
            Err(nix::Error::EIO) => {
                // Slave side hung up; the SIGCHLD path drives shutdown.
                tokio::time::sleep(PTY_POLL).await;
            }
            Err(e) => {
                warn!("PTY read error: {e}");
                return;
            }
        }
    }
}

async fn broadcast_output(shared: &Shared, data: &[u8]) {
    let mut failed = Vec::new();
    {
        let clients = shared.clients.read().await;
        for (&id, handle) in clients.iter() {
            let mut writer = handle.writer.lock().await;
            match timeout(CLIENT_WRITE_TIMEOUT, writer.write_all(data)).await {
                Ok(Ok(())) => {}
                _ => failed.push(id),
            }
        }
    }
    for id in failed {
        debug!(client = id, "dropping client after failed write");
        remove_client(shared, id).await;
    }
}

/// Periodic sweep dropping clients idle past the thirty-second bound.
async fn client_monitor(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                let stale: Vec<u64> = shared
                    .clients
                    .read()
                    .await
                    .iter()
                    .filter(|(_, handle)| {
                        handle
                            .last_activity
                            .lock()
                            .map(|t| now.duration_since(*t) > CLIENT_IDLE_TIMEOUT)
                            .unwrap_or(false)
                    })
                    .map(|(&id, _)| id)
                    .collect();
                for id in stale {
                    debug!(client = id, "idle timeout");
                    remove_client(&shared, id).await;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

async fn remove_client(shared: &Shared, id: u64) {
    if shared.clients.write().await.remove(&id).is_some() {
        debug!(client = id, "removed client");
    }
}

async fn touch_client(shared: &Shared, id: u64) {
    if let Some(handle) = shared.clients.read().await.get(&id) {
        if let Ok(mut t) = handle.last_activity.lock() {
            *t = Instant::now();
        }
    }
}

/// Write a whole buffer to a non-blocking fd, retrying short writes.
fn write_all_fd(fd: BorrowedFd<'_>, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        match nix::unistd::write(fd, data) {
            Ok(n) => data = &data[n..],
            Err(nix::Error::EAGAIN | nix::Error::EINTR) => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
