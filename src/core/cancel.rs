// Cooperative cancellation flag observed by long-running consumers between polls.
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
