//! Graceful shutdown with connection draining.
//!
//! Every reactor subscribes to one [`ShutdownSignal`]. On Ctrl+C or SIGTERM
//! the listeners stop accepting, control sessions close (which frees their
//! domains), and in-flight relays get until the drain timeout to finish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shutdown signal shared by every listener and connection task.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutting_down: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
    drain_timeout: Duration,
}

impl ShutdownSignal {
    pub fn new(drain_timeout: Duration) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
            active: Arc::new(AtomicUsize::new(0)),
            drain_timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown initiated");
        }
        let _ = self.notify.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Resolves once shutdown has been triggered, including before the call.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Count a connection as in flight until the guard drops.
    pub fn track(&self) -> ConnectionGuard {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active, "connection opened");
        ConnectionGuard {
            counter: self.active.clone(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Wait for tracked connections to finish. False if the drain timeout
    /// expired first.
    pub async fn wait_for_drain(&self) -> bool {
        info!(
            active = self.active_connections(),
            timeout = ?self.drain_timeout,
            "Waiting for connections to drain"
        );
        let drained = async {
            while self.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(self.drain_timeout, drained).await {
            Ok(()) => {
                info!("All connections drained");
                true
            }
            Err(_) => {
                warn!(
                    active = self.active_connections(),
                    "Drain timeout reached with connections still active"
                );
                false
            }
        }
    }
}

/// Decrements the in-flight counter on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(active, "connection closed");
    }
}

/// Wait for Ctrl+C or SIGTERM, then trigger `signal`.
pub async fn wait_for_signal(signal: &ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }

    signal.trigger();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_and_trigger() {
        let signal = ShutdownSignal::new(Duration::from_secs(5));
        assert!(!signal.is_shutting_down());

        let guard = signal.track();
        assert_eq!(signal.active_connections(), 1);

        signal.trigger();
        assert!(signal.is_shutting_down());
        signal.triggered().await;

        drop(guard);
        assert_eq!(signal.active_connections(), 0);
        assert!(signal.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let signal = ShutdownSignal::new(Duration::from_millis(150));
        let _guard = signal.track();
        assert!(!signal.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let signal = ShutdownSignal::new(Duration::from_secs(1));
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        tokio::task::yield_now().await;
        signal.trigger();
        waiter.await.unwrap();
    }
}
