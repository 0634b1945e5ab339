//! sess — persistent interactive terminal sessions.
//!
//! A session is a shell supervised by a background daemon that owns a PTY
//! pair and a Unix socket. A client attaches to the socket from any
//! terminal, detaches at will, and reattaches later; the shell keeps
//! running in between.

pub mod cli;
pub mod client;
pub mod daemon;
pub mod protocol;
pub mod pty;
pub mod registry;

pub use cli::Cli;
pub use client::{attach, AttachConfig, AttachError};
pub use daemon::{Daemon, DaemonError};
pub use registry::{Registry, RegistryError, Session};
