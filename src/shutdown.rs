//! Graceful shutdown handling.
//!
//! A `ShutdownCoordinator` listens for SIGTERM/SIGINT and lets the
//! server loop and background tasks wind down in order: stop accepting
//! API requests, let in-flight run drivers checkpoint, flush the event
//! sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Coordinates graceful shutdown across the process.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown is requested; immediately when it already
    /// was.
    pub async fn wait_for_shutdown(&self) {
        loop {
            if self.is_shutdown_requested() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Spawn the signal listener. On Unix this watches SIGTERM and
    /// SIGINT; elsewhere Ctrl+C.
    pub fn start_signal_listener(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate());
                let sigint = signal::unix::signal(signal::unix::SignalKind::interrupt());
                match (sigterm, sigint) {
                    (Ok(mut sigterm), Ok(mut sigint)) => {
                        tokio::select! {
                            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                        }
                    }
                    _ => {
                        warn!("Failed to install signal handlers, falling back to Ctrl+C");
                        signal::ctrl_c().await.ok();
                    }
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C, shutting down");
            }

            coordinator.request_shutdown();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn request_is_idempotent_and_observable() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_requested());
        coordinator.request_shutdown();
        coordinator.request_shutdown();
        assert!(coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn wait_resolves_for_past_and_future_requests() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();
        tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown())
            .await
            .unwrap();

        let coordinator = ShutdownCoordinator::new();
        let signaller = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signaller.request_shutdown();
        });
        tokio::time::timeout(Duration::from_secs(1), coordinator.wait_for_shutdown())
            .await
            .unwrap();
    }
}
