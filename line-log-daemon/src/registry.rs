use std::{collections::HashMap, net::SocketAddr, time::Duration};

use tokio::{
    task::{JoinError, JoinHandle},
    time::{self, Instant},
};
use tracing::{debug, error, warn};

use crate::{
    error::{Error, Result},
    shutdown::ShutdownToken,
    worker::ConnectionId,
};

struct WorkerEntry {
    peer: SocketAddr,
    handle: JoinHandle<()>,
    close: ShutdownToken,
}

impl WorkerEntry {
    fn is_completed(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Every spawned worker, from spawn until it has been joined.
///
/// Owned by the acceptor alone. An entry leaves the map only after its
/// handle has been awaited, so each worker is joined exactly once.
pub struct WorkerRegistry {
    entries: HashMap<ConnectionId, WorkerEntry>,
    draining: bool,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            draining: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracks a freshly spawned worker. `close` must be the token the worker
    /// watches for forced closure.
    ///
    /// Refused once the drain has started; the caller owns the handle again
    /// and must deal with it.
    pub fn register(
        &mut self,
        id: ConnectionId,
        peer: SocketAddr,
        handle: JoinHandle<()>,
        close: ShutdownToken,
    ) -> Result<(), (Error, JoinHandle<()>)> {
        if self.draining {
            return Err((Error::ShutdownInProgress, handle));
        }
        self.entries.insert(id, WorkerEntry { peer, handle, close });
        Ok(())
    }

    /// Joins and removes every worker that has already finished.
    pub async fn reap(&mut self) -> usize {
        let finished: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_completed())
            .map(|(id, _)| *id)
            .collect();

        for id in &finished {
            if let Some(entry) = self.entries.remove(id) {
                report_join(*id, entry.peer, entry.handle.await);
            }
        }

        if !finished.is_empty() {
            debug!(reaped = finished.len(), live = self.entries.len(), "reaped workers");
        }
        finished.len()
    }

    /// Closes every remaining connection and joins every worker.
    ///
    /// Workers get `grace` in total to notice the close; any still running
    /// after that are aborted, then joined like the rest.
    pub async fn drain_all(&mut self, grace: Duration) -> usize {
        self.draining = true;

        for entry in self.entries.values() {
            entry.close.trigger();
        }

        let deadline = Instant::now() + grace;
        let mut joined = 0;

        let mut ids: Vec<ConnectionId> = self.entries.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(entry) = self.entries.remove(&id) else {
                continue;
            };
            let WorkerEntry { peer, mut handle, .. } = entry;

            let outcome = match time::timeout_at(deadline, &mut handle).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(%id, %peer, "worker did not stop in time, aborting");
                    handle.abort();
                    handle.await
                }
            };
            report_join(id, peer, outcome);
            joined += 1;
        }

        debug!(joined, "worker registry drained");
        joined
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn report_join(id: ConnectionId, peer: SocketAddr, outcome: Result<(), JoinError>) {
    match outcome {
        Ok(()) => debug!(%id, %peer, "worker joined"),
        Err(err) if err.is_cancelled() => debug!(%id, %peer, "aborted worker joined"),
        Err(err) => error!(%id, %peer, error = %err, "worker panicked"),
    }
}
