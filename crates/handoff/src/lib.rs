//! # handoff
//!
//! Zero-downtime restart and graceful shutdown for a long-running server
//! process.
//!
//! ## Overview
//!
//! A restart works by:
//! 1. Duplicating the listening socket and passing it to a freshly spawned
//!    copy of the current executable at fd 3, with `--graceful` appended to
//!    its arguments
//! 2. The new process adopts fd 3 instead of binding, and accepts immediately
//! 3. The old process stops accepting and drains in-flight connections
//! 4. After drain (or the grace period), the old process exits
//!
//! A stop is the same drain without the successor.
//!
//! ## Signal Conventions
//!
//! The signal-to-action mapping is configurable. Platform defaults:
//!
//! - Linux: `SIGTERM` stops, `SIGINT` restarts
//! - Other Unix: `SIGINT` and `SIGTERM` stop, `SIGUSR2` restarts
//!
//! ## Example
//!
//! ```ignore
//! use handoff::{Graceful, InvocationMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), handoff::Error> {
//!     let mode = InvocationMode::from_args(std::env::args_os());
//!     Graceful::new("127.0.0.1:8080", MyHandler)
//!         .mode(mode)
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("handoff requires a Unix platform (Linux or macOS)");

mod connection;
mod dispatch;
mod error;
mod graceful;
mod listener;
mod restart;
mod server;
mod shutdown;
mod signals;

pub use connection::{Connection, ConnectionHandler, READ_TIMEOUT, WRITE_TIMEOUT};
pub use dispatch::Dispatcher;
pub use error::{AcquireError, ConfigError, Error, RestartError, ServeError, ShutdownError};
pub use graceful::Graceful;
pub use listener::{
    acquire, adopt, bind, Addr, InvocationMode, ListeningSocket, GRACEFUL_FLAG, INHERITED_FD,
};
pub use restart::{Restart, SuccessorCommand};
pub use server::{GenerationState, Server, ServerHandle, DEFAULT_SHUTDOWN_TIMEOUT};
pub use signals::{Action, Defaults, Signal, SignalRegistry};
