//! Cooperative shutdown signalling.
//!
//! The coordinator owns two phases. The graceful phase stops source readers
//! and lets in-flight batches flush and commit. The force phase fires when the
//! drain deadline elapses and is observed by every remaining suspend point
//! (queue sends, network calls, backoff sleeps) so tasks return promptly.

use tokio::sync::watch;

/// A cloneable handle that resolves once shutdown has been requested.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when shutdown is requested. Cancel-safe: dropping the future
    /// and calling again later still observes the signal.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow() {
                return;
            }
            // A dropped coordinator counts as shutdown.
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// A signal that never fires. Used by tests and by finite pipeline runs
    /// that complete on their own.
    pub fn noop() -> Self {
        let (trigger, receiver) = watch::channel(false);
        // Leak the sender so the channel never closes.
        std::mem::forget(trigger);
        Self { receiver }
    }
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    graceful: watch::Sender<bool>,
    force: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (graceful, _) = watch::channel(false);
        let (force, _) = watch::channel(false);
        Self { graceful, force }
    }

    /// Signal observed by source readers: stop admitting new records.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.graceful.subscribe(),
        }
    }

    /// Signal observed by writers and backoff sleeps: abandon in-flight work.
    pub fn subscribe_force(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.force.subscribe(),
        }
    }

    pub fn begin_shutdown(&self) {
        self.graceful.send_replace(true);
    }

    pub fn force_shutdown(&self) {
        self.graceful.send_replace(true);
        self.force.send_replace(true);
    }
}
