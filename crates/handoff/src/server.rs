//! Server lifecycle for one process generation.
//!
//! A generation moves `Created → Serving → ShuttingDown → Terminated` and
//! never back. [`Server::serve`] runs the accept loop; any clone of the
//! [`ServerHandle`] can shut the generation down. Only one drain ever runs:
//! concurrent and repeated shutdown calls all observe its outcome.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionHandler};
use crate::error::{ServeError, ShutdownError};
use crate::listener::ListeningSocket;
use crate::shutdown::GracefulShutdown;

/// Grace period used when none (or zero) is configured.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Created,
    Serving,
    ShuttingDown,
    Terminated,
}

/// A generation that has not started serving yet.
pub struct Server<H> {
    listener: Arc<ListeningSocket>,
    handler: Arc<H>,
    handle: ServerHandle,
}

/// Cloneable control handle for a generation.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

struct Inner {
    /// Upgradable only while the accept loop (or the unserved `Server`)
    /// still holds the listener.
    listener: Weak<ListeningSocket>,
    shutdown: GracefulShutdown,
    state: watch::Sender<GenerationState>,
    outcome: OnceCell<Result<(), ShutdownError>>,
    /// Cancelled once the accept loop has stopped and closed the listener.
    listener_closed: CancellationToken,
}

impl<H: ConnectionHandler> Server<H> {
    /// Wrap `listener` and `handler`. A zero `shutdown_timeout` selects
    /// [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub fn new(listener: ListeningSocket, handler: H, shutdown_timeout: Duration) -> Self {
        let grace = if shutdown_timeout.is_zero() {
            DEFAULT_SHUTDOWN_TIMEOUT
        } else {
            shutdown_timeout
        };

        let listener = Arc::new(listener);
        let (state, _) = watch::channel(GenerationState::Created);
        let inner = Inner {
            listener: Arc::downgrade(&listener),
            shutdown: GracefulShutdown::new(grace),
            state,
            outcome: OnceCell::new(),
            listener_closed: CancellationToken::new(),
        };

        Self {
            listener,
            handler: Arc::new(handler),
            handle: ServerHandle {
                inner: Arc::new(inner),
            },
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept and serve connections until the generation shuts down.
    ///
    /// A shutdown through the handle is a normal termination: this returns
    /// `Ok(())` once the drain has finished. A fatal accept error drains the
    /// generation and is returned.
    pub async fn serve(self) -> Result<(), ServeError> {
        let Server {
            listener,
            handler,
            handle,
        } = self;
        let inner = &handle.inner;

        let started = inner.state.send_if_modified(|state| {
            if *state == GenerationState::Created {
                *state = GenerationState::Serving;
                true
            } else {
                false
            }
        });
        if !started {
            debug!("Generation shut down before serving");
            drop(listener);
            inner.listener_closed.cancel();
            handle.terminated().await;
            return Ok(());
        }

        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Serving connections"),
            Err(_) => info!("Serving connections"),
        }

        let result = accept_loop(&listener, &handler, &inner.shutdown).await;

        drop(listener);
        inner.listener_closed.cancel();

        if let Err(err) = result {
            error!(error = %err, "Accept loop failed, draining generation");
            let _ = handle.shutdown().await;
            return Err(ServeError::Accept(err));
        }

        handle.terminated().await;
        info!("Generation terminated");
        Ok(())
    }
}

impl ServerHandle {
    /// Stop accepting, drain in-flight connections for up to the grace
    /// period, then force-close the rest.
    ///
    /// Exactly one drain runs per generation. Concurrent and later callers
    /// wait for it and receive the same result.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.inner
            .outcome
            .get_or_init(|| self.run_shutdown())
            .await
            .clone()
    }

    async fn run_shutdown(&self) -> Result<(), ShutdownError> {
        let previous = self.inner.state.send_replace(GenerationState::ShuttingDown);
        info!(
            previous = ?previous,
            grace_ms = self.inner.shutdown.grace().as_millis() as u64,
            "Shutting down generation"
        );

        self.inner.shutdown.trigger_stop();
        if previous == GenerationState::Serving {
            // Connections accepted up to this point are counted before the
            // drain starts.
            self.inner.listener_closed.cancelled().await;
        }

        let result = self.inner.shutdown.drain().await;
        if let Err(err) = &result {
            warn!(error = %err, "Drain cut short");
        }

        self.inner.state.send_replace(GenerationState::Terminated);
        result
    }

    pub fn state(&self) -> GenerationState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.inner.state.subscribe()
    }

    /// Wait until the generation has terminated.
    pub async fn terminated(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == GenerationState::Terminated)
            .await;
    }

    pub fn active_connections(&self) -> usize {
        self.inner.shutdown.active_connections()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.inner.shutdown.grace()
    }

    /// The listener, while it is still open.
    pub(crate) fn listener(&self) -> Option<Arc<ListeningSocket>> {
        self.inner.listener.upgrade()
    }
}

async fn accept_loop<H: ConnectionHandler>(
    listener: &ListeningSocket,
    handler: &Arc<H>,
    shutdown: &GracefulShutdown,
) -> io::Result<()> {
    let stop = shutdown.stop_token();
    let mut backoff = Duration::ZERO;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                info!("Stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff = Duration::ZERO;

                let guard = shutdown.connection_guard();
                let force_close = shutdown.force_close_token();
                let handler = Arc::clone(handler);
                let conn = Connection::new(stream, peer.clone());

                tokio::spawn(async move {
                    let _guard = guard;
                    tokio::select! {
                        result = handler.handle(conn) => {
                            if let Err(err) = result {
                                debug!(peer = %peer, error = %err, "Connection handler failed");
                            }
                        }
                        _ = force_close.cancelled() => {
                            debug!(peer = %peer, "Connection force-closed");
                        }
                    }
                });
            }
            Err(err) if is_transient(&err) => {
                backoff = if backoff.is_zero() {
                    MIN_ACCEPT_BACKOFF
                } else {
                    (backoff * 2).min(MAX_ACCEPT_BACKOFF)
                };
                warn!(error = %err, retry_ms = backoff.as_millis() as u64, "Transient accept error");

                tokio::select! {
                    _ = stop.cancelled() => {
                        info!("Stopped accepting connections");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Accept errors worth retrying: the failed connection or a temporary
/// resource shortage, not the listener itself.
fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => true,
        _ => matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        ),
    }
}
