//! Command-line surface.
//!
//! The internal `--daemon` invocation is not part of this parser; `main`
//! recognizes it by hand before clap runs, since it carries positional
//! paths that never face a user.

use clap::Parser;

/// Minimal session persistence tool.
///
/// With no arguments a new session is created and attached. Sessions are
/// numbered sequentially (001, 002, ...); `1` and `001` both work.
#[derive(Debug, Parser)]
#[command(name = "sess", version, about = "Minimal session persistence tool")]
pub struct Cli {
    /// Attach to a session by number.
    #[arg(short = 'a', value_name = "NUM")]
    pub attach: Option<String>,

    /// Attach to a session, creating it first if it does not exist.
    #[arg(short = 'A', value_name = "NUM")]
    pub attach_create: Option<String>,

    /// Detach the currently attached client.
    #[arg(short = 'x')]
    pub detach: bool,

    /// Kill a session by number (the current session when no number given).
    #[arg(short = 'k', value_name = "NUM")]
    pub kill: Option<Option<String>>,

    /// Kill all sessions.
    #[arg(short = 'K')]
    pub kill_all: bool,

    /// Let Ctrl-X pass through to the shell instead of detaching.
    #[arg(short = 'C', long = "no-ctrlx")]
    pub no_ctrlx: bool,

    /// `ls` lists all sessions.
    #[arg(value_parser = ["ls"])]
    pub command: Option<String>,
}
