//! Detaching from the controlling terminal.

use std::{fs::OpenOptions, io, os::fd::AsRawFd, process};

use tracing::info;

use crate::error::{Error, Result};

/// Forks into the background and starts a new session.
///
/// The parent exits with status 0 once the child exists. Call this only
/// while the process is single-threaded, i.e. before the runtime is built.
pub fn detach() -> Result<()> {
    // SAFETY: no other threads exist yet, so the child inherits a
    // consistent address space.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::startup("forking", io::Error::last_os_error()));
    }
    if pid > 0 {
        info!(child = pid, "detached into background");
        process::exit(0);
    }

    // SAFETY: plain syscall with no pointer arguments.
    if unsafe { libc::setsid() } < 0 {
        return Err(Error::startup("starting a new session", io::Error::last_os_error()));
    }

    redirect_stdio().map_err(|err| Error::startup("redirecting stdio", err))
}

fn redirect_stdio() -> io::Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
