//! Command line and environment configuration.

use std::time::Duration;

use clap::Parser;
use handoff::{InvocationMode, Signal};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "handoff-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "HANDOFF_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: String,

    /// Seconds to let in-flight connections finish on stop or restart (0 uses the default)
    #[arg(long, env = "HANDOFF_SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Signals that stop the server, e.g. `TERM,QUIT` (platform default if empty)
    #[arg(long, env = "HANDOFF_STOP_SIGNALS", value_delimiter = ',')]
    pub stop_signals: Vec<Signal>,

    /// Signals that restart the server, e.g. `USR2` (platform default if empty)
    #[arg(long, env = "HANDOFF_RESTART_SIGNALS", value_delimiter = ',')]
    pub restart_signals: Vec<Signal>,

    /// Adopt the listener inherited from the previous generation (set on restart)
    #[arg(long, hide = true)]
    pub graceful: bool,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub shutdown_timeout: Duration,
    pub stop_signals: Vec<Signal>,
    pub restart_signals: Vec<Signal>,
    pub mode: InvocationMode,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            addr: cli.addr,
            shutdown_timeout: Duration::from_secs(cli.shutdown_timeout),
            stop_signals: cli.stop_signals,
            restart_signals: cli.restart_signals,
            mode: InvocationMode::from_flag(cli.graceful),
        }
    }
}

impl ServerConfig {
    /// Log the configuration (for debugging).
    pub fn log_config(&self) {
        info!(
            addr = %self.addr,
            mode = %self.mode,
            shutdown_timeout_secs = self.shutdown_timeout.as_secs(),
            stop_signals = ?self.stop_signals,
            restart_signals = ?self.restart_signals,
            "Server configuration"
        );
    }
}
