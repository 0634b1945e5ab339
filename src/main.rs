//! sess — persistent interactive terminal sessions.

use chrono::Local;
use clap::Parser;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sess::client::{self, AttachConfig};
use sess::daemon::Daemon;
use sess::registry::{self, Registry};
use sess::Cli;
use std::error::Error;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();

    // Internal invocation:
    //   sess --daemon <num> <socket> <meta> <shell> [rows cols]
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 6 && args[1] == "--daemon" {
        run_daemon(&args).await;
        return;
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("SESS_DEBUG").as_deref() == Ok("1") {
        EnvFilter::new("sess=debug")
    } else {
        EnvFilter::new("sess=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_daemon(args: &[String]) {
    let rows = args.get(6).and_then(|v| v.parse().ok()).unwrap_or(0);
    let cols = args.get(7).and_then(|v| v.parse().ok()).unwrap_or(0);
    let daemon = Daemon::new(
        args[2].clone(),
        PathBuf::from(&args[3]),
        PathBuf::from(&args[4]),
    );
    if let Err(e) = daemon.run(&args[5], rows, cols).await {
        eprintln!("daemon failed to start: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let registry = Registry::open()?;
    let disable_ctrl_x = cli.no_ctrlx;

    if let Some(number) = cli.attach {
        handle_attach(&registry, &number, disable_ctrl_x).await
    } else if let Some(number) = cli.attach_create {
        handle_attach_create(&registry, &number, disable_ctrl_x).await
    } else if cli.detach {
        handle_detach(&registry)
    } else if cli.kill_all {
        handle_kill_all(&registry)
    } else if let Some(number) = cli.kill {
        handle_kill(&registry, number)
    } else if cli.command.as_deref() == Some("ls") {
        handle_list(&registry)
    } else {
        handle_create(&registry, disable_ctrl_x).await
    }
}

async fn handle_create(registry: &Registry, disable_ctrl_x: bool) -> Result<(), Box<dyn Error>> {
    if let Some(current) = registry::session_from_env() {
        return Err(format!("Cannot create session from within existing session {current}").into());
    }

    // Hold the registry lock until the daemon's metadata is on disk (it
    // lands before the socket), so parallel creates get distinct numbers.
    let (number, lock) = registry.next_session_number()?;
    spawn_daemon(registry, &number)?;
    wait_for_socket(&registry.socket_path(&number));
    drop(lock);

    registry.set_current(&number, std::process::id() as i32)?;
    println!(
        "Created session {} at {}",
        number,
        Local::now().format("%Y-%m-%d %H:%M")
    );

    attach_and_clear(registry, &number, disable_ctrl_x)
        .await
        .map_err(|e| format!("Failed to attach to new session: {e}").into())
}

async fn handle_attach(
    registry: &Registry,
    number: &str,
    disable_ctrl_x: bool,
) -> Result<(), Box<dyn Error>> {
    let number = registry::normalize_number(number);

    if registry::session_from_env().as_deref() == Some(number.as_str()) {
        return Err(format!("Already attached to session {number}").into());
    }

    let session = registry.get_session(&number)?;

    registry.set_current(&session.number, std::process::id() as i32)?;
    attach_and_clear(registry, &session.number, disable_ctrl_x)
        .await
        .map_err(Into::into)
}

async fn handle_attach_create(
    registry: &Registry,
    number: &str,
    disable_ctrl_x: bool,
) -> Result<(), Box<dyn Error>> {
    let number = registry::normalize_number(number);

    if let Some(current) = registry::session_from_env() {
        return Err(format!("Cannot create session from within existing session {current}").into());
    }

    if registry.get_session(&number).is_ok() {
        return handle_attach(registry, &number, disable_ctrl_x).await;
    }

    spawn_daemon(registry, &number)?;
    wait_for_socket(&registry.socket_path(&number));

    registry.set_current(&number, std::process::id() as i32)?;
    println!(
        "Created session {} at {}",
        number,
        Local::now().format("%Y-%m-%d %H:%M")
    );

    attach_and_clear(registry, &number, disable_ctrl_x)
        .await
        .map_err(|e| format!("Failed to attach to new session: {e}").into())
}

/// Attach, then release the attachment slot whatever happened.
async fn attach_and_clear(
    registry: &Registry,
    number: &str,
    disable_ctrl_x: bool,
) -> Result<(), sess::AttachError> {
    let config = AttachConfig {
        session_num: number.to_string(),
        socket_path: registry.socket_path(number),
        disable_ctrl_x,
    };
    let result = client::attach(config).await;
    let _ = registry.clear_current();
    result
}

fn handle_detach(registry: &Registry) -> Result<(), Box<dyn Error>> {
    let info = match registry.current_info()? {
        Some(info) if !info.number.is_empty() && info.pid != 0 => info,
        _ => return Err("Not attached to any session".into()),
    };

    match kill(Pid::from_raw(info.pid), Signal::SIGUSR1) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            // Stale marker; clear and report.
            let _ = registry.clear_current();
            Err("Not attached to any session".into())
        }
        Err(e) => Err(format!("Failed to detach: {e}").into()),
    }
}

fn handle_kill(registry: &Registry, number: Option<String>) -> Result<(), Box<dyn Error>> {
    let number = match number {
        Some(number) => registry::normalize_number(&number),
        None => registry::session_from_env().ok_or("Not attached to any session")?,
    };

    registry.kill_session(&number)?;
    println!("Killed session {number}");
    Ok(())
}

fn handle_kill_all(registry: &Registry) -> Result<(), Box<dyn Error>> {
    let sessions = registry.list_sessions()?;
    if sessions.is_empty() {
        println!("No active sessions");
        return Ok(());
    }
    for session in sessions {
        match registry.kill_session(&session.number) {
            Ok(()) => println!("Killed session {}", session.number),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

fn handle_list(registry: &Registry) -> Result<(), Box<dyn Error>> {
    let sessions = registry.list_sessions()?;
    if sessions.is_empty() {
        println!("No active sessions");
        return Ok(());
    }

    // Inside a session the environment is authoritative; outside, fall
    // back to the validated current-attachment pointer.
    let current = registry::session_from_env()
        .or_else(|| registry.current_session().ok().flatten())
        .unwrap_or_default();

    println!("SESSION  STATUS    CREATED              PID     CMD");
    for session in &sessions {
        let attached = session.number == current;
        let indicator = if attached { "* " } else { "  " };
        let status = if attached { "attached" } else { "detached" };
        println!(
            "{indicator}{:>3}   {:<9} {:<20} {:<7} {}",
            session.number,
            status,
            session.created_at.format("%Y-%m-%d %H:%M"),
            session.pid,
            session.command,
        );
    }

    if !current.is_empty() {
        println!("\n* indicates current session ({current})");
    }
    Ok(())
}

/// Fork a daemon for `number` in its own session and hand it our window
/// size so the PTY is right from the first prompt.
fn spawn_daemon(registry: &Registry, number: &str) -> Result<(), Box<dyn Error>> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let (rows, cols) = client::terminal_size().unwrap_or((0, 0));

    let exe = std::env::current_exe().map_err(|e| format!("Failed to fork daemon: {e}"))?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon")
        .arg(number)
        .arg(registry.socket_path(number))
        .arg(registry.meta_path(number))
        .arg(&shell)
        .arg(rows.to_string())
        .arg(cols.to_string());

    // The daemon must outlive this process and its terminal.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn().map_err(|e| format!("Failed to fork daemon: {e}"))?;
    Ok(())
}

/// Poll for the daemon's socket; readiness means the shell is running and
/// metadata is on disk. Connection errors surface later if it never came up.
fn wait_for_socket(path: &Path) {
    for _ in 0..20 {
        if path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
