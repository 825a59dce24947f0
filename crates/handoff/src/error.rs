//! Error types for the handoff core.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

use crate::signals::Signal;

/// Errors found while checking configuration, before anything is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No listen address was given
    #[error("Listen address has not been set")]
    MissingAddress,

    /// No signal triggers a stop, even after applying platform defaults
    #[error("No signal is bound to the stop action")]
    NoStopSignal,

    /// No signal triggers a restart, even after applying platform defaults
    #[error("No signal is bound to the restart action")]
    NoRestartSignal,

    /// The same signal was bound to both actions
    #[error("{0} is bound to both stop and restart")]
    ConflictingSignal(Signal),

    /// The signal cannot be handled by a process (SIGKILL, SIGSTOP)
    #[error("{0} cannot be caught by a process")]
    UncatchableSignal(Signal),

    /// A signal name or number could not be parsed
    #[error("Invalid signal: {0:?}")]
    InvalidSignal(String),

    /// The successor command has no program to execute
    #[error("Cannot determine the program to re-execute on restart")]
    MissingProgram,
}

/// Errors obtaining the listening socket.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Binding a fresh listener failed
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        /// The address as given in configuration
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The inherited descriptor is absent or not a listening TCP socket
    #[error("Inherited fd {fd} is not a usable listener: {source}")]
    Inherited {
        /// The descriptor number that was inspected
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Returned by [`ServerHandle::shutdown`](crate::ServerHandle::shutdown)
/// when the drain did not finish inside the grace period.
///
/// The shutdown still completes; the listed connections were force-closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// Connections were still open when the grace period expired
    #[error("Grace period of {grace:?} expired, force-closed {forced} connection(s)")]
    Drain {
        /// Connections that were force-closed
        forced: usize,
        /// The grace period that elapsed
        grace: Duration,
    },
}

/// Fatal errors from the accept loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Accepting failed with a non-transient error
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Errors from a restart attempt.
///
/// Apart from [`RestartError::Drain`], the current generation is untouched
/// and keeps serving.
#[derive(Debug, Error)]
pub enum RestartError {
    /// The listener has no descriptor that the successor could adopt
    #[error("Listener does not support descriptor handoff")]
    Unsupported,

    /// The generation is already shutting down
    #[error("Generation is already shutting down")]
    ShuttingDown,

    /// A successor was already spawned by an earlier restart
    #[error("A restart is already in progress")]
    InProgress,

    /// Duplicating the listening descriptor failed
    #[error("Failed to duplicate listener descriptor: {0}")]
    Descriptor(#[source] io::Error),

    /// Creating the successor process failed
    #[error("Failed to spawn successor {program}: {source}")]
    Spawn {
        /// The program that was executed
        program: String,
        #[source]
        source: io::Error,
    },

    /// The successor runs, but the old generation's drain was cut short
    #[error("Successor {pid} spawned, but drain was cut short: {source}")]
    Drain {
        /// Process id of the successor
        pid: u32,
        #[source]
        source: ShutdownError,
    },
}

/// Errors returned by [`Graceful::run`](crate::Graceful::run).
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be obtained
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// Installing a signal handler failed
    #[error("Failed to register handler for {signal}: {source}")]
    Signal {
        /// The signal that could not be registered
        signal: Signal,
        #[source]
        source: io::Error,
    },

    /// The accept loop failed
    #[error(transparent)]
    Serve(#[from] ServeError),
}
