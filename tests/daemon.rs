//! End-to-end daemon tests: run the real binary in `--daemon` mode and
//! speak the wire protocol over its socket.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonUnderTest {
    child: Child,
    shell_pid: i32,
    _dir: TempDir,
    socket: PathBuf,
    meta: PathBuf,
}

impl DaemonUnderTest {
    /// Spawn `sess --daemon` on a throwaway root and wait until its socket
    /// is ready.
    fn start(number: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join(format!("session-{number}.sock"));
        let meta = dir.path().join(format!("session-{number}.meta"));

        let child = Command::new(env!("CARGO_BIN_EXE_sess"))
            .arg("--daemon")
            .arg(number)
            .arg(&socket)
            .arg(&meta)
            .arg("/bin/sh")
            .arg("24")
            .arg("80")
            .spawn()
            .expect("failed to spawn daemon");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket.exists() {
            assert!(
                Instant::now() < deadline,
                "daemon socket never appeared at {socket:?}"
            );
            std::thread::sleep(Duration::from_millis(20));
        }

        let meta_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&meta).unwrap()).unwrap();
        let shell_pid = meta_json["pid"].as_i64().unwrap() as i32;

        Self {
            child,
            shell_pid,
            _dir: dir,
            socket,
            meta,
        }
    }

    fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.socket).expect("connect to daemon");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    /// Connect and consume the `READY\n` greeting.
    fn attach(&self) -> UnixStream {
        let mut stream = self.connect();
        assert_eq!(read_chunk(&mut stream), b"READY\n");
        stream
    }

    fn terminate(&self) {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
    }

    fn wait_for_exit(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl Drop for DaemonUnderTest {
    fn drop(&mut self) {
        self.terminate();
        if !self.wait_for_exit(Duration::from_secs(3)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
            // The daemon never got to clean up its shell.
            unsafe {
                libc::kill(self.shell_pid, libc::SIGKILL);
            }
        }
    }
}

fn read_chunk(stream: &mut UnixStream) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).expect("read from daemon");
    buf[..n].to_vec()
}

/// Accumulate socket output until `needle` shows up or the deadline hits.
fn read_until(stream: &mut UnixStream, needle: &str, limit: Duration) -> String {
    let deadline = Instant::now() + limit;
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&collected).contains(needle) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => panic!("socket read failed: {e}"),
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[test]
fn test_metadata_written_before_socket() {
    let daemon = DaemonUnderTest::start("900");

    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&daemon.meta).unwrap()).unwrap();
    assert_eq!(meta["session_num"], "900");
    assert_eq!(meta["command"], "/bin/sh");
    assert!(meta["pid"].as_i64().unwrap() > 0);
    assert!(meta["created_at"].as_str().unwrap().contains('T'));
    assert!(process_alive(daemon.shell_pid));

    use std::os::unix::fs::PermissionsExt;
    let meta_mode = std::fs::metadata(&daemon.meta).unwrap().permissions().mode();
    assert_eq!(meta_mode & 0o777, 0o600);
    let sock_mode = std::fs::metadata(&daemon.socket)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(sock_mode & 0o777, 0o600);
}

#[test]
fn test_greeting_and_single_client_invariant() {
    let daemon = DaemonUnderTest::start("901");

    let mut first = daemon.attach();

    // The attachment slot is taken; a second client is rejected before READY.
    let mut second = daemon.connect();
    let rejection = read_chunk(&mut second);
    assert_eq!(
        rejection,
        b"ERROR: Session already has an active connection\n"
    );

    // The first client is unaffected.
    first.write_all(b"PING\n").unwrap();
    assert_eq!(read_chunk(&mut first), b"PONG\n");
}

#[test]
fn test_disconnect_frees_the_slot() {
    let daemon = DaemonUnderTest::start("902");

    let mut first = daemon.attach();
    first.write_all(b"DISCONNECT\n").unwrap();

    // The daemon closes the connection...
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut buf = [0u8; 256];
    loop {
        match first.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "daemon never closed the socket");
    }

    // ...and the session survives for the next client.
    let mut again = daemon.attach();
    again.write_all(b"PING\n").unwrap();
    assert_eq!(read_chunk(&mut again), b"PONG\n");
}

#[test]
fn test_shell_io_roundtrip() {
    let daemon = DaemonUnderTest::start("903");
    let mut stream = daemon.attach();

    stream.write_all(b"echo round-trip-$SESS_NUM\n").unwrap();
    let output = read_until(&mut stream, "round-trip-903", Duration::from_secs(5));
    assert!(
        output.contains("round-trip-903"),
        "shell output not seen: {output:?}"
    );
}

#[test]
fn test_resize_applies_to_pty() {
    let daemon = DaemonUnderTest::start("904");
    let mut stream = daemon.attach();

    stream.write_all(b"RESIZE 31 99\n").unwrap();
    // The frame has no reply; prove the daemon is still serving.
    stream.write_all(b"PING\n").unwrap();
    assert_eq!(read_chunk(&mut stream), b"PONG\n");

    stream.write_all(b"stty size\n").unwrap();
    let output = read_until(&mut stream, "31 99", Duration::from_secs(5));
    assert!(output.contains("31 99"), "resize not applied: {output:?}");
}

#[test]
fn test_terminate_cleans_up_files_and_shell() {
    let mut daemon = DaemonUnderTest::start("905");
    let shell_pid = daemon.shell_pid;

    daemon.terminate();
    assert!(daemon.wait_for_exit(Duration::from_secs(5)), "daemon hung");

    assert!(!daemon.socket.exists());
    assert!(!daemon.meta.exists());

    // TERM, one-second grace, then KILL; either way the shell is gone.
    let deadline = Instant::now() + Duration::from_secs(3);
    while process_alive(shell_pid) {
        assert!(Instant::now() < deadline, "shell survived daemon shutdown");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_refuses_symlinked_socket_path() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("session-907.sock");
    let meta = dir.path().join("session-907.meta");
    let target = dir.path().join("elsewhere");
    std::fs::write(&target, b"").unwrap();
    std::os::unix::fs::symlink(&target, &socket).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_sess"))
        .arg("--daemon")
        .arg("907")
        .arg(&socket)
        .arg(&meta)
        .arg("/bin/sh")
        .arg("24")
        .arg("80")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("symlink"), "stderr: {stderr}");

    // The symlink was left alone and the startup was unwound.
    assert!(socket.symlink_metadata().unwrap().file_type().is_symlink());
    assert!(!meta.exists());
}

#[test]
fn test_shell_exit_shuts_daemon_down() {
    let mut daemon = DaemonUnderTest::start("906");
    let mut stream = daemon.attach();

    stream.write_all(b"exit\n").unwrap();

    assert!(
        daemon.wait_for_exit(Duration::from_secs(10)),
        "daemon kept running after its shell exited"
    );
    assert!(!daemon.socket.exists());
    assert!(!daemon.meta.exists());
}
