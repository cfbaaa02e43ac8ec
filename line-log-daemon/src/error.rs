//! Error type shared by every layer of the daemon.

use std::io;

use thiserror::Error;

/// Failures the daemon distinguishes between.
///
/// Per-connection failures (`Io`, `Lock`) end only the worker that hit
/// them. `ProtocolOverflow` is reported and then ignored. `Startup` is
/// fatal and maps to a non-zero exit status.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading, writing or opening a socket or the log file failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log store's exclusive section could not be acquired because it
    /// has been torn down.
    #[error("log store exclusive section is no longer available")]
    Lock,

    /// A record grew past the configured cap; the tail was dropped.
    #[error("record exceeded {limit} bytes, dropped {dropped} trailing bytes")]
    ProtocolOverflow { limit: usize, dropped: usize },

    /// Work was refused because the daemon is shutting down.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Something the daemon needs before it can serve failed to come up.
    #[error("startup failed while {stage}: {source}")]
    Startup {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn startup(stage: &'static str, source: io::Error) -> Self {
        Self::Startup { stage, source }
    }

    /// Whether the error ends the whole process rather than one worker.
    #[cfg(test)]
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Self::Startup { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
