//! One-shot readiness gate.
//!
//! Completion traffic waits here until the first successful model load opens
//! the gate. Opening is a one-time transition: a second `open()` is a caller
//! contract violation. It is logged and reported through the return value,
//! it never panics.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ReadinessGate {
    open_tx: watch::Sender<bool>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (open_tx, _) = watch::channel(false);
        Self { open_tx }
    }

    /// Open the gate, releasing every current and future waiter.
    ///
    /// Returns `true` for the call that opened it and `false` afterwards.
    pub fn open(&self) -> bool {
        let opened = self.open_tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        });
        if !opened {
            tracing::error!("Readiness gate opened more than once");
        }
        opened
    }

    pub fn is_open(&self) -> bool {
        *self.open_tx.borrow()
    }

    /// Wait until the gate is open. No timeout.
    pub async fn wait(&self) {
        let mut open_rx = self.open_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = open_rx.wait_for(|open| *open).await;
    }
}
