//! Top-level entry point: check configuration, acquire the listener, start
//! the dispatcher and serve.

use std::time::Duration;

use tracing::info;

use crate::connection::ConnectionHandler;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Error};
use crate::listener::{self, InvocationMode};
use crate::restart::{Restart, SuccessorCommand};
use crate::server::Server;
use crate::signals::{Signal, SignalRegistry};

/// Builder for a gracefully restartable server.
pub struct Graceful<H> {
    addr: String,
    handler: H,
    shutdown_timeout: Duration,
    stop_signals: Vec<Signal>,
    restart_signals: Vec<Signal>,
    mode: InvocationMode,
    successor: Option<SuccessorCommand>,
}

impl<H: ConnectionHandler> Graceful<H> {
    /// Serve `handler` on `addr`, in [`InvocationMode::Fresh`] unless told
    /// otherwise.
    pub fn new(addr: impl Into<String>, handler: H) -> Self {
        Self {
            addr: addr.into(),
            handler,
            shutdown_timeout: Duration::ZERO,
            stop_signals: Vec::new(),
            restart_signals: Vec::new(),
            mode: InvocationMode::Fresh,
            successor: None,
        }
    }

    /// Grace period for draining; zero selects the default.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Signals that stop the server; empty selects the platform default.
    pub fn stop_signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.stop_signals = signals.into_iter().collect();
        self
    }

    /// Signals that restart the server; empty selects the platform default.
    pub fn restart_signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.restart_signals = signals.into_iter().collect();
        self
    }

    pub fn mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Command used to start a successor; defaults to this process's own
    /// command line.
    pub fn successor(mut self, command: SuccessorCommand) -> Self {
        self.successor = Some(command);
        self
    }

    /// Validate the configuration and build the signal registry.
    pub fn check(&self) -> Result<SignalRegistry, ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        SignalRegistry::new(
            self.stop_signals.iter().copied(),
            self.restart_signals.iter().copied(),
        )
    }

    /// Run the server until it is stopped or handed to a successor.
    ///
    /// Configuration, acquisition and signal registration errors are
    /// returned before anything is served.
    pub async fn run(self) -> Result<(), Error> {
        let registry = self.check()?;
        let successor = match self.successor {
            Some(command) => command,
            None => SuccessorCommand::current()?,
        };

        info!(mode = %self.mode, addr = %self.addr, pid = std::process::id(), "Starting generation");
        let listener = listener::acquire(self.mode, &self.addr).await?;

        let server = Server::new(listener, self.handler, self.shutdown_timeout);
        let handle = server.handle();
        let restart = Restart::new(handle.clone(), self.mode, successor);
        let dispatch_loop = Dispatcher::new(registry, handle, restart).spawn()?;

        let result = server.serve().await;
        dispatch_loop.abort();
        result.map_err(Error::from)
    }
}
