//! Operator-requested cancellation.
//!
//! SIGINT (Ctrl-C) and SIGTERM both trigger the same `Shutdown` handle. The
//! supervisor waits on it at its suspension point and then runs the normal
//! termination path, so an interrupted run still persists its samples and
//! kills the child's process tree.
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Cloneable cancellation flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once shutdown has been requested (immediately if it already was).
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Route SIGINT and SIGTERM to this handle. Must be called inside a tokio runtime.
    pub fn install(&self) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("received SIGINT, stopping monitor"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping monitor"),
            }
            shutdown.trigger();
        });
        Ok(())
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.triggered().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .expect("trigger should stick");
    }

    #[tokio::test]
    async fn test_already_triggered_resolves_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .expect("should resolve at once");
    }
}
