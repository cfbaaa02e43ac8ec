//! TCP daemon that appends every newline-terminated record a client sends
//! to one shared log file and replays the whole log back to that client
//! after each record.
//!
//! See `README.md` for usage and the wire behaviour. Each module focuses on
//! a concrete responsibility:
//!
//! - [`server`] binds the listening socket, runs the accept loop and drives
//!   the shutdown sequence.
//! - [`worker`] serves one connection: framing, commit and replay.
//! - [`registry`] tracks spawned workers, reaps finished ones and drains
//!   the rest at shutdown.
//! - [`store`] owns the backing file and the exclusive section that
//!   serializes every access to it.
//! - [`timestamp`] appends a wall-clock record on a fixed period.
//! - [`record`] splits the incoming byte stream into records.
//! - [`shutdown`] is the cancellation token shared by the blocking loops.
//! - [`config`], [`cli`], [`daemon`] and [`error`] cover settings, the
//!   command line, detaching and the error type.
//!
//! Integration tests drive the server in-process over loopback and the
//! binary end to end.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod record;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod timestamp;
pub mod worker;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::Server;
