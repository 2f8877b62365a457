use std::sync::Arc;
use tokio::sync::watch;

/// Run-wide cancellation signal. Clones share state; once set it stays set.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancel on Ctrl-C. Used by the CLI so a long harvest keeps what it has.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::warn!(target = "harvest", "Ctrl+C detected; cancelling at next request boundary");
                    flag.cancel();
                }
                Err(err) => {
                    tracing::warn!(target = "harvest", error = %err, "failed to install Ctrl+C handler");
                }
            }
        });
    }
}
