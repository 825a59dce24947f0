//! Drain coordination.
//!
//! `ConnectionGuard`s count in-flight connections; the drain waits for the
//! count to reach zero or for the grace period to expire, after which the
//! force-close token is cancelled and the remaining connections are dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ShutdownError;

/// Tracks one in-flight connection; the count drops when this is dropped.
pub(crate) struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Stop, drain and force-close coordination for one generation.
pub(crate) struct GracefulShutdown {
    /// Cancelled when the accept loop should stop.
    stop_accepting: CancellationToken,

    /// Cancelled when the grace period expires with connections still open.
    force_close: CancellationToken,

    /// Active connection counter.
    connection_count: Arc<AtomicUsize>,

    /// Notified when the last connection drains.
    drain_notify: Arc<Notify>,

    grace: Duration,
}

impl GracefulShutdown {
    pub(crate) fn new(grace: Duration) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            force_close: CancellationToken::new(),
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            grace,
        }
    }

    pub(crate) fn grace(&self) -> Duration {
        self.grace
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    pub(crate) fn force_close_token(&self) -> CancellationToken {
        self.force_close.clone()
    }

    /// Count a new connection until the returned guard is dropped.
    pub(crate) fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: Arc::clone(&self.connection_count),
            notify: Arc::clone(&self.drain_notify),
        }
    }

    pub(crate) fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub(crate) fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Wait for all connections to complete, force-closing whatever is left
    /// when the grace period expires.
    pub(crate) async fn drain(&self) -> Result<(), ShutdownError> {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return Ok(());
        }

        info!(
            active_connections = active,
            grace_ms = self.grace.as_millis() as u64,
            "Draining active connections"
        );

        if tokio::time::timeout(self.grace, self.wait_for_drain())
            .await
            .is_ok()
        {
            info!("All connections drained cleanly");
            return Ok(());
        }

        let forced = self.active_connections();
        if forced == 0 {
            info!("All connections drained cleanly");
            return Ok(());
        }

        warn!(
            remaining_connections = forced,
            grace_ms = self.grace.as_millis() as u64,
            "Grace period expired, force-closing connections"
        );
        self.force_close.cancel();
        self.wait_for_drain().await;

        Err(ShutdownError::Drain {
            forced,
            grace: self.grace,
        })
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            tokio::pin!(notified);
            // Register before checking so a drop in between is not missed.
            notified.as_mut().enable();
            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
