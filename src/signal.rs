//! Open/closed lifecycle signal
//!
//! Background tasks (the NAD watch loop, the TLS file watcher, the HTTPS
//! server) report whether they are running through a [`Signal`]. Owners wait
//! on it with a bounded limit so shutdown never blocks on a wedged task.

use std::time::Duration;

use tokio::sync::watch;

use crate::{Error, Result};

/// Smallest accepted wait limit
pub const MIN_WAIT: Duration = Duration::from_millis(2);

/// A level-triggered open/closed flag that can be awaited with a timeout.
///
/// Starts closed. `close` is idempotent and only wakes waiters on an actual
/// open-to-closed transition.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// Create a closed signal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Mark the signal open
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Mark the signal closed. Closing a closed signal is a no-op.
    pub fn close(&self) {
        self.tx.send_if_modified(|open| std::mem::replace(open, false));
    }

    /// Whether the signal is currently open
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Whether the signal is currently closed
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Wait up to `limit` for the signal to be open
    pub async fn wait_until_open(&self, limit: Duration) -> Result<()> {
        self.wait_for(true, limit).await
    }

    /// Wait up to `limit` for the signal to be closed
    pub async fn wait_until_closed(&self, limit: Duration) -> Result<()> {
        self.wait_for(false, limit).await
    }

    async fn wait_for(&self, state: bool, limit: Duration) -> Result<()> {
        if limit < MIN_WAIT {
            return Err(Error::config(format!(
                "wait limit {:?} is below the minimum of {:?}",
                limit, MIN_WAIT
            )));
        }

        let mut rx = self.tx.subscribe();
        let result = match tokio::time::timeout(limit, rx.wait_for(|open| *open == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::internal("signal sender dropped while waiting")),
            Err(_) => Err(Error::Timeout(limit)),
        };
        result
    }
}
