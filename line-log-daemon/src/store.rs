//! The shared append-only log and its exclusive section.
//!
//! Every access to the backing file goes through [`LogStore::lock`]. The
//! returned [`LogGuard`] is the only way to append or replay, so a worker's
//! append-then-replay and the timer's append each run as one critical
//! section and no replay can interleave with another caller's write.
//!
//! The section is a single-permit semaphore. Permits are granted in FIFO
//! order, so commit order is the order callers queued in. Closing the
//! semaphore is how shutdown tears the section down.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Semaphore, SemaphorePermit},
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    record::Record,
};

pub struct LogStore {
    path: PathBuf,
    section: Semaphore,
}

impl LogStore {
    /// Creates (or truncates) the backing file so the log starts empty.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        File::create(&path).await?;
        debug!(path = %path.display(), "log store created");
        Ok(Self {
            path,
            section: Semaphore::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enters the exclusive section, waiting behind earlier callers.
    pub async fn lock(&self) -> Result<LogGuard<'_>> {
        let permit = self.section.acquire().await.map_err(|_| Error::Lock)?;
        Ok(LogGuard {
            path: &self.path,
            _permit: permit,
        })
    }

    /// Destroys the exclusive section. Callers already inside finish
    /// normally; every later `lock` fails with [`Error::Lock`].
    pub fn teardown(&self) {
        self.section.close();
    }

    #[cfg(test)]
    pub(crate) fn is_torn_down(&self) -> bool {
        self.section.is_closed()
    }

    pub async fn remove_backing_file(&self) -> Result<()> {
        fs::remove_file(&self.path).await?;
        Ok(())
    }
}

/// Proof of holding the exclusive section.
pub struct LogGuard<'a> {
    path: &'a Path,
    _permit: SemaphorePermit<'a>,
}

impl LogGuard<'_> {
    /// Appends one record. Opens in append mode each time, never truncates
    /// or seeks.
    pub async fn append(&mut self, record: &Record) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path)
            .await?;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Sends the whole log as it stands to `destination`.
    ///
    /// The size is captured once up front and exactly that many bytes are
    /// sent, however many writes it takes. Returns the byte count.
    pub async fn replay_all<W>(&mut self, destination: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let file = File::open(self.path).await?;
        let size = file.metadata().await?.len();

        let mut source = file.take(size);
        let sent = tokio::io::copy(&mut source, destination).await?;
        if sent != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("log shrank during replay: sent {sent} of {size} bytes"),
            )));
        }

        destination.flush().await?;
        Ok(sent)
    }
}
