use std::sync::Arc;

use tokio::sync::watch;

/// One-way "stop now" flag that blocked tasks can wait on.
///
/// The acceptor and the timestamp writer share the process-wide token.
/// Every registered connection gets a token of its own, which the registry
/// fires to close that connection during the drain.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    flag: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Sets the flag and wakes every waiter. Idempotent.
    pub fn trigger(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is set, immediately if it already is.
    pub async fn triggered(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn waiters_wake_when_triggered() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.triggered().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(!token.is_triggered());

        token.trigger();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_triggered());
    }

    #[tokio::test]
    async fn late_waiters_resolve_immediately() {
        let token = ShutdownToken::new();
        token.trigger();
        token.trigger();
        timeout(Duration::from_millis(100), token.triggered())
            .await
            .expect("already triggered");
    }
}
