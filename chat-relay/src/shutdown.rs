use std::sync::Arc;

use tokio::sync::watch;

/// One-shot stop request shared by a background loop and its controller.
///
/// Triggering is idempotent, and every clone observes the same signal.
/// [`StopSignal::wait`] resolves immediately once the signal has fired, so
/// racing it against a sleep or read makes that wait interruptible.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
