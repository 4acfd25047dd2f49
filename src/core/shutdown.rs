//! Shutdown signalling shared between a handler and its delivery workers.

use tokio::sync::watch;
use tracing::info;

/// Owning side of the shutdown signal. Dropping it also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cheap, cloneable listener handed to each worker.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!(target: "producer::shutdown", "shutdown signalled");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown has been triggered or the trigger was dropped.
    pub async fn recv(&mut self) {
        // wait_for errors only when the sender is gone, which is shutdown too.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn recv_completes_after_trigger() {
        let (trigger, mut shutdown) = channel();
        assert!(!shutdown.is_shutdown());

        trigger.trigger();
        timeout(Duration::from_millis(100), shutdown.recv())
            .await
            .expect("shutdown not observed");
        assert!(shutdown.is_shutdown());
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_releases_listeners() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);
        timeout(Duration::from_millis(100), shutdown.recv())
            .await
            .expect("listener still blocked");
    }
}
