//! Signal dispatch.
//!
//! Every registered signal gets its own listener task that forwards
//! deliveries into an unbounded channel. A single loop drains the channel in
//! arrival order and runs each action to completion before taking the next.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, RestartError};
use crate::restart::Restart;
use crate::server::ServerHandle;
use crate::signals::{Action, Signal, SignalRegistry};

/// Maps incoming signals to stop and restart of one generation.
pub struct Dispatcher {
    registry: SignalRegistry,
    server: ServerHandle,
    restart: Restart,
}

impl Dispatcher {
    pub fn new(registry: SignalRegistry, server: ServerHandle, restart: Restart) -> Self {
        Self {
            registry,
            server,
            restart,
        }
    }

    /// Register handlers for every signal in the registry and start the
    /// dispatch loop.
    ///
    /// Registration happens before this returns, so a signal sent after it
    /// returns is never lost to the default disposition.
    pub fn spawn(self) -> Result<JoinHandle<()>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        for sig in self.registry.signals() {
            let mut stream = signal(SignalKind::from_raw(sig.as_raw()))
                .map_err(|source| Error::Signal { signal: sig, source })?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(sig).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        info!(
            stop = ?self.registry.signals_for(Action::Stop),
            restart = ?self.registry.signals_for(Action::Restart),
            "Listening for signals"
        );

        Ok(tokio::spawn(self.run(rx)))
    }

    async fn run(self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(sig) = signals.recv().await {
            self.dispatch(sig).await;
        }
    }

    /// Run the action bound to `sig`, returning it, or `None` if the signal
    /// is not registered.
    pub async fn dispatch(&self, sig: Signal) -> Option<Action> {
        let Some(action) = self.registry.lookup(sig) else {
            debug!(signal = %sig, "Ignoring unregistered signal");
            return None;
        };

        info!(signal = %sig, action = %action, "Received signal");
        match action {
            Action::Stop => match self.server.shutdown().await {
                Ok(()) => info!("Stop complete"),
                Err(err) => warn!(error = %err, "Stop complete, connections were force-closed"),
            },
            Action::Restart => match self.restart.restart().await {
                Ok(pid) => info!(successor = pid, "Restart complete"),
                Err(RestartError::Drain { pid, source }) => warn!(
                    successor = pid,
                    error = %source,
                    "Restart complete, connections were force-closed"
                ),
                Err(err) => error!(error = %err, "Restart failed, current generation keeps serving"),
            },
        }
        Some(action)
    }
}
