//! Cooperative shutdown for the worker.
//!
//! A `ShutdownCoordinator` is a cloneable flag plus a wakeup. The scheduler
//! loop selects on `wait_for_shutdown()` between polls, so a SIGINT/SIGTERM
//! lets the batch in flight finish persisting before the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared shutdown flag.
///
/// ```rust
/// use dripflow::shutdown::ShutdownCoordinator;
///
/// async fn drain(shutdown: ShutdownCoordinator) {
///     while !shutdown.is_shutdown_requested() {
///         // poll once
///         # shutdown.request_shutdown();
///     }
///     shutdown.wait_for_shutdown().await;
/// }
/// ```
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a request between the two
        // cannot be missed.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Request shutdown on SIGINT or SIGTERM (Ctrl+C off Unix).
    pub fn listen_for_signals(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use signal::unix::{signal as unix_signal, SignalKind};

                match (
                    unix_signal(SignalKind::terminate()),
                    unix_signal(SignalKind::interrupt()),
                ) {
                    (Ok(mut sigterm), Ok(mut sigint)) => {
                        tokio::select! {
                            _ = sigterm.recv() => info!("Received SIGTERM"),
                            _ = sigint.recv() => info!("Received SIGINT"),
                        }
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Unix signal handlers unavailable, using Ctrl+C: {}", e);
                        if let Err(e) = signal::ctrl_c().await {
                            warn!("Failed to listen for Ctrl+C: {}", e);
                            return;
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C");
            }

            coordinator.request_shutdown();
        });
    }
}
