use std::{sync::Arc, time::Duration};

use chrono::Local;
use tokio::{
    select,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::{record::Record, shutdown::ShutdownToken, store::LogStore};

/// Starts the periodic timestamp writer.
///
/// The first record lands one full `period` after the call. Returns `None`
/// when the timer cannot be armed, which leaves the daemon running without
/// timestamps.
pub fn spawn(
    period: Duration,
    store: Arc<LogStore>,
    shutdown: ShutdownToken,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        error!("cannot arm timestamp timer with a zero period; continuing without timestamps");
        return None;
    }

    let mut ticks = time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(?period, "timestamp writer armed");

    Some(tokio::spawn(async move {
        loop {
            select! {
                _ = shutdown.triggered() => break,
                _ = ticks.tick() => {
                    if !write_timestamp(&store).await {
                        break;
                    }
                }
            }
        }
        debug!("timestamp writer stopped");
    }))
}

/// Appends one timestamp record. Returns `false` once the store is gone.
async fn write_timestamp(store: &LogStore) -> bool {
    let record = Record::timestamp(&Local::now());

    let mut guard = match store.lock().await {
        Ok(guard) => guard,
        Err(err) => {
            debug!(error = %err, "log store closed, stopping timestamp writer");
            return false;
        }
    };

    match guard.append(&record).await {
        Ok(()) => {
            let line = String::from_utf8_lossy(record.as_bytes());
            debug!(record = %line.trim_end(), "timestamp appended");
        }
        Err(err) => error!(error = %err, "failed to append timestamp"),
    }
    true
}
