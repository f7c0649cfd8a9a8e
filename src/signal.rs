//! Latch-like async event with set/clear/wait semantics.
//!
//! The connection lifecycle is driven by three such latches: the session's
//! *connected* and *data-updated* events and the connector's *reconnection
//! gate*. Waiters observe the current value, so a `set()` that happens before
//! `wait()` is never lost.

use tokio::sync::watch;

/// A settable/clearable flag that async tasks can wait on.
///
/// Unlike [`tokio::sync::Notify`], a waiter that arrives after `set()` still
/// proceeds immediately; `clear()` re-arms the latch for the next cycle.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    /// Creates a signal in the given initial state.
    pub fn new(initially_set: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_set);
        Self { tx }
    }

    pub fn set(&self) {
        // send_replace never fails even with no receivers alive
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal is set. Returns immediately if already set.
    /// Callers bound this with [`tokio::time::timeout`].
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed channel.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let signal = Signal::new(true);
        timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait should not block on a set signal");
    }

    #[tokio::test]
    async fn wait_blocks_until_set() {
        let signal = std::sync::Arc::new(Signal::new(false));
        assert!(timeout(Duration::from_millis(20), signal.wait())
            .await
            .is_err());

        let setter = std::sync::Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set();
        });
        timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("wait should resolve once set");
    }

    #[tokio::test]
    async fn clear_rearms_the_latch() {
        let signal = Signal::new(true);
        signal.clear();
        assert!(!signal.is_set());
        assert!(timeout(Duration::from_millis(20), signal.wait())
            .await
            .is_err());
        signal.set();
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn set_before_wait_is_not_lost() {
        let signal = Signal::new(false);
        signal.set();
        timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("set before wait must be observed");
    }
}
