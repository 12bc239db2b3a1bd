//! Graceful shutdown coordination for LiveTok.
//!
//! A [`ShutdownSignal`] is cloned into every long-running task (the HTTP
//! server, the comment drain, the stream listener). When a termination
//! signal arrives, or [`ShutdownSignal::trigger`] is called, every clone
//! observes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use livetok::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let stop = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     let mut ticker = tokio::time::interval(Duration::from_millis(200));
//!     loop {
//!         tokio::select! {
//!             _ = stop.cancelled() => break,
//!             _ = ticker.tick() => { /* drain one comment */ }
//!         }
//!     }
//! });
//!
//! shutdown.wait_for_os_signal().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default grace period for tasks to finish after shutdown.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    grace_period: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown; later calls are no-ops.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            info!("Shutdown triggered");
            let _ = self.sender.send(());
        }
    }

    /// Resolves once shutdown has been triggered, including before the call.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Wait for Ctrl+C or SIGTERM, then trigger.
    pub async fn wait_for_os_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => {}
        }

        self.trigger();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
