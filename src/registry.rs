//! Filesystem-backed session catalog.
//!
//! The registry owns the storage root, the inter-process lock, and the
//! current-attachment pointer. Session metadata itself is written by the
//! daemon once its shell is running; the registry reads, validates, and
//! garbage-collects it. Dead sessions and stale attachment pointers are
//! cleaned up lazily, so the root self-heals after a crash of either the
//! daemon or a client.

use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Environment variable the daemon exports to its shell child. Every
/// process inside a session inherits it; the value is the session number.
pub const SESSION_ENV: &str = "SESS_NUM";

/// Overrides the storage root directory (used by the test suite).
pub const ROOT_ENV: &str = "SESS_DIR";

pub(crate) const CURRENT_FILE: &str = ".current_session";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(10);
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Errors that can occur in the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} does not exist")]
    NotFound(String),

    #[error("session {0} is dead")]
    SessionDead(String),

    #[error("session {0} is already dead")]
    AlreadyDead(String),

    #[error("failed to acquire registry lock: timed out")]
    LockTimeout,

    #[error("failed to signal session: {0}")]
    Signal(#[source] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid session metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Metadata for one session, persisted as `session-<NNN>.meta`.
///
/// The recorded PID is the daemon's *shell child*; it is what liveness
/// probes target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "session_num", alias = "number")]
    pub number: String,
    pub created_at: DateTime<Local>,
    pub pid: i32,
    pub command: String,
}

impl Session {
    /// Atomically persist to `path` (write temp, then rename), mode 0600.
    pub fn write_atomic(&self, path: &Path) -> Result<(), RegistryError> {
        let data = serde_json::to_vec_pretty(self)?;
        write_file_atomic(path, &data)?;
        Ok(())
    }
}

/// The current-attachment pointer, persisted as `.current_session`.
///
/// `pid` is the attached *client* process; it receives SIGUSR1 for
/// out-of-band detach. Legacy files holding a bare session number are
/// read as `pid: 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentAttachment {
    pub number: String,
    pub pid: i32,
}

/// Holds the whole-registry lock; dropped on release (including unwind).
pub struct RegistryLock<'a> {
    path: PathBuf,
    _serial: std::sync::MutexGuard<'a, ()>,
}

impl Drop for RegistryLock<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Filesystem-backed catalog of sessions.
pub struct Registry {
    base_dir: PathBuf,
    serial: Mutex<()>,
}

impl Registry {
    /// Open the per-user registry (`$SESS_DIR` or `~/.sess`), creating the
    /// storage root with mode 0700 if needed. Idempotent.
    pub fn open() -> Result<Self, RegistryError> {
        let base_dir = match std::env::var_os(ROOT_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "failed to get home directory")
                })?
                .join(".sess"),
        };
        Self::with_root(base_dir)
    }

    /// Open a registry rooted at an explicit directory.
    pub fn with_root(base_dir: PathBuf) -> Result<Self, RegistryError> {
        fs::create_dir_all(&base_dir)?;
        fs::set_permissions(&base_dir, fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            base_dir,
            serial: Mutex::new(()),
        })
    }

    /// The storage root.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of a session's listening socket.
    #[must_use]
    pub fn socket_path(&self, number: &str) -> PathBuf {
        self.base_dir.join(format!("session-{number}.sock"))
    }

    /// Path of a session's metadata file.
    #[must_use]
    pub fn meta_path(&self, number: &str) -> PathBuf {
        self.base_dir.join(format!("session-{number}.meta"))
    }

    /// Acquire the whole-registry lock: exclusive creation of `.lock`,
    /// polling on collision up to a five-second deadline.
    fn lock(&self) -> Result<RegistryLock<'_>, RegistryError> {
        let serial = self
            .serial
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let path = self.base_dir.join(LOCK_FILE);
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(_) => {
                    return Ok(RegistryLock {
                        path,
                        _serial: serial,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(RegistryError::LockTimeout);
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Allocate the next session number: the formatted successor of the
    /// maximum live ID, `001` when the root is empty.
    ///
    /// The returned lock is still held; the caller keeps it until the new
    /// session's metadata is on disk (the daemon writes it before binding
    /// its socket), so concurrent launchers cannot be handed the same
    /// number.
    pub fn next_session_number(&self) -> Result<(String, RegistryLock<'_>), RegistryError> {
        let lock = self.lock()?;
        let sessions = self.scan_live()?;
        let max = sessions
            .iter()
            .filter_map(|s| s.number.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok((format!("{:03}", max + 1), lock))
    }

    /// List live sessions sorted by number, garbage-collecting any whose
    /// shell PID is gone.
    pub fn list_sessions(&self) -> Result<Vec<Session>, RegistryError> {
        let _lock = self.lock()?;
        self.scan_live()
    }

    fn scan_live(&self) -> Result<Vec<Session>, RegistryError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(number) = name
                .strip_prefix("session-")
                .and_then(|n| n.strip_suffix(".meta"))
            else {
                continue;
            };
            let Ok(data) = fs::read(entry.path()) else {
                continue;
            };
            let Ok(session) = serde_json::from_slice::<Session>(&data) else {
                continue;
            };
            if !process_alive(session.pid) {
                debug!(number, "garbage-collecting dead session");
                self.cleanup_session(number);
                continue;
            }
            sessions.push(session);
        }
        sessions.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(sessions)
    }

    /// Look up one session, garbage-collecting it if its shell is gone.
    pub fn get_session(&self, number: &str) -> Result<Session, RegistryError> {
        let data = match fs::read(self.meta_path(number)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(number.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let session: Session = serde_json::from_slice(&data)?;
        if !process_alive(session.pid) {
            self.cleanup_session(number);
            return Err(RegistryError::SessionDead(number.to_string()));
        }
        Ok(session)
    }

    /// Kill a session: SIGTERM the shell, wait a second, SIGKILL if still
    /// alive, then remove its files and any current pointer to it.
    pub fn kill_session(&self, number: &str) -> Result<(), RegistryError> {
        let session = self.get_session(number)?;

        match signal::kill(Pid::from_raw(session.pid), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.cleanup_session(number);
                return Err(RegistryError::AlreadyDead(number.to_string()));
            }
            Err(e) => return Err(RegistryError::Signal(e)),
        }

        std::thread::sleep(KILL_GRACE);

        if process_alive(session.pid) {
            let _ = signal::kill(Pid::from_raw(session.pid), Signal::SIGKILL);
        }

        self.cleanup_session(number);
        Ok(())
    }

    /// Record the attached client for a session (atomic replace).
    pub fn set_current(&self, number: &str, client_pid: i32) -> Result<(), RegistryError> {
        let info = CurrentAttachment {
            number: number.to_string(),
            pid: client_pid,
        };
        let data = serde_json::to_vec(&info)?;
        write_file_atomic(&self.base_dir.join(CURRENT_FILE), &data)?;
        Ok(())
    }

    /// Raw read of the current-attachment pointer, tolerating the legacy
    /// bare-number payload.
    pub fn current_info(&self) -> Result<Option<CurrentAttachment>, RegistryError> {
        let data = match fs::read(self.base_dir.join(CURRENT_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&data);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if !trimmed.starts_with('{') {
            // Legacy payload: bare session number, no client PID recorded.
            return Ok(Some(CurrentAttachment {
                number: trimmed.to_string(),
                pid: 0,
            }));
        }
        Ok(Some(serde_json::from_str(trimmed)?))
    }

    /// Validated current session: the recorded client must be alive and
    /// the session must still exist, else the pointer is cleared and no
    /// attachment is reported.
    pub fn current_session(&self) -> Result<Option<String>, RegistryError> {
        let Some(info) = self.current_info()? else {
            return Ok(None);
        };
        if info.pid != 0 && !process_alive(info.pid) {
            let _ = self.clear_current();
            return Ok(None);
        }
        if self.get_session(&info.number).is_err() {
            let _ = self.clear_current();
            return Ok(None);
        }
        Ok(Some(info.number))
    }

    /// Remove the current-attachment pointer. Absence is not an error.
    pub fn clear_current(&self) -> Result<(), RegistryError> {
        match fs::remove_file(self.base_dir.join(CURRENT_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup_session(&self, number: &str) {
        let _ = fs::remove_file(self.socket_path(number));
        let _ = fs::remove_file(self.meta_path(number));
        if let Ok(Some(info)) = self.current_info() {
            if info.number == number {
                let _ = self.clear_current();
            }
        }
    }
}

/// Zero-pad a numeric session number to width three; non-numeric input
/// passes through unchanged (lookup then fails normally).
#[must_use]
pub fn normalize_number(number: &str) -> String {
    match number.parse::<u32>() {
        Ok(n) => format!("{n:03}"),
        Err(_) => number.to_string(),
    }
}

/// True when this process runs inside a session (the daemon exported
/// `SESS_NUM` to the shell and we inherited it).
#[must_use]
pub fn in_session() -> bool {
    session_from_env().is_some()
}

/// The enclosing session number, if any.
#[must_use]
pub fn session_from_env() -> Option<String> {
    match std::env::var(SESSION_ENV) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

/// Null-signal liveness probe. "No such process" means dead; any other
/// outcome (including EPERM) counts as alive.
fn process_alive(pid: i32) -> bool {
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(data)?;
    drop(file);

    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_number_pads() {
        assert_eq!(normalize_number("1"), "001");
        assert_eq!(normalize_number("12"), "012");
        assert_eq!(normalize_number("007"), "007");
        assert_eq!(normalize_number("1000"), "1000");
    }

    #[test]
    fn test_normalize_number_idempotent() {
        for input in ["1", "042", "abc", "1000", ""] {
            let once = normalize_number(input);
            assert_eq!(normalize_number(&once), once);
        }
    }

    #[test]
    fn test_normalize_number_passes_through_non_numeric() {
        assert_eq!(normalize_number("abc"), "abc");
        assert_eq!(normalize_number("-1"), "-1");
    }

    #[test]
    fn test_session_json_field_names() {
        let session = Session {
            number: "007".into(),
            created_at: Local::now(),
            pid: 1234,
            command: "/bin/sh".into(),
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"session_num\":\"007\""));
        assert!(json.contains("\"pid\":1234"));

        // Readers also accept `number` as the key.
        let alt = r#"{"number":"007","created_at":"2026-08-02T10:00:00+00:00","pid":1,"command":"/bin/sh"}"#;
        let parsed: Session = serde_json::from_str(alt).unwrap();
        assert_eq!(parsed.number, "007");
    }

    #[test]
    fn test_process_alive_probe() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(99_999_999));
    }
}
