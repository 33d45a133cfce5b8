//! Watch-channel based shutdown signalling shared by the transport reader,
//! the response dispatcher, and in-flight RPC waits.

use tokio::sync::watch;

/// Owning side of a shutdown signal. Triggering it wakes every listener;
/// the signal is idempotent and cannot be un-triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

/// Listening side handed to background tasks and raced by awaitable
/// operations.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Signals shutdown to every listener.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown has been triggered. A dropped [`ShutdownSignal`]
    /// counts as triggered so orphaned tasks still wind down.
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}
