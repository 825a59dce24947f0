//! Mapping from OS signals to lifecycle actions.
//!
//! The registry is built once during the configuration check and is
//! read-only afterwards. Empty caller-supplied sets fall back to
//! [`Defaults::platform`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// An OS signal, identified by its raw number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal(libc::c_int);

impl Signal {
    pub const HUP: Signal = Signal(libc::SIGHUP);
    pub const INT: Signal = Signal(libc::SIGINT);
    pub const QUIT: Signal = Signal(libc::SIGQUIT);
    pub const ILL: Signal = Signal(libc::SIGILL);
    pub const FPE: Signal = Signal(libc::SIGFPE);
    pub const KILL: Signal = Signal(libc::SIGKILL);
    pub const USR1: Signal = Signal(libc::SIGUSR1);
    pub const SEGV: Signal = Signal(libc::SIGSEGV);
    pub const USR2: Signal = Signal(libc::SIGUSR2);
    pub const TERM: Signal = Signal(libc::SIGTERM);
    pub const STOP: Signal = Signal(libc::SIGSTOP);

    const NAMED: [(Signal, &'static str); 11] = [
        (Signal::HUP, "SIGHUP"),
        (Signal::INT, "SIGINT"),
        (Signal::QUIT, "SIGQUIT"),
        (Signal::ILL, "SIGILL"),
        (Signal::FPE, "SIGFPE"),
        (Signal::KILL, "SIGKILL"),
        (Signal::USR1, "SIGUSR1"),
        (Signal::SEGV, "SIGSEGV"),
        (Signal::USR2, "SIGUSR2"),
        (Signal::TERM, "SIGTERM"),
        (Signal::STOP, "SIGSTOP"),
    ];

    /// Wrap a raw signal number.
    pub const fn from_raw(raw: libc::c_int) -> Self {
        Signal(raw)
    }

    /// The raw signal number.
    pub const fn as_raw(self) -> libc::c_int {
        self.0
    }

    /// Conventional name, e.g. `SIGTERM`, if this is a well-known signal.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(signal, _)| *signal == self)
            .map(|(_, name)| *name)
    }

    /// Whether a handler can be installed for this signal.
    ///
    /// `SIGKILL` and `SIGSTOP` cannot be caught at all; the synchronous fault
    /// signals cannot be turned into async notifications.
    pub fn is_catchable(self) -> bool {
        !matches!(
            self,
            Signal::KILL | Signal::STOP | Signal::ILL | Signal::FPE | Signal::SEGV
        )
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "signal {}", self.0),
        }
    }
}

impl FromStr for Signal {
    type Err = ConfigError;

    /// Accepts `SIGTERM`, `TERM`, `term` or a raw number such as `15`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(raw) = trimmed.parse::<libc::c_int>() {
            if raw > 0 {
                return Ok(Signal(raw));
            }
            return Err(ConfigError::InvalidSignal(s.to_string()));
        }

        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        Self::NAMED
            .iter()
            .find(|(_, known)| &known[3..] == name)
            .map(|(signal, _)| *signal)
            .ok_or_else(|| ConfigError::InvalidSignal(s.to_string()))
    }
}

/// What the process does when a registered signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Drain in-flight connections and exit.
    Stop,
    /// Hand the listener to a successor, then drain and exit.
    Restart,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Stop => write!(f, "stop"),
            Action::Restart => write!(f, "restart"),
        }
    }
}

/// Signal sets used when the caller supplies none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defaults {
    pub stop: Vec<Signal>,
    pub restart: Vec<Signal>,
}

impl Defaults {
    /// Defaults for the platform this was compiled for.
    #[cfg(target_os = "linux")]
    pub fn platform() -> Self {
        Self {
            stop: vec![Signal::TERM],
            restart: vec![Signal::INT],
        }
    }

    /// Defaults for the platform this was compiled for.
    #[cfg(not(target_os = "linux"))]
    pub fn platform() -> Self {
        Self {
            stop: vec![Signal::INT, Signal::TERM],
            restart: vec![Signal::USR2],
        }
    }
}

/// Signal → action lookup table.
#[derive(Debug, Clone)]
pub struct SignalRegistry {
    actions: HashMap<Signal, Action>,
}

impl SignalRegistry {
    /// Build a registry, falling back to the platform defaults for any
    /// empty set.
    pub fn new(
        stop: impl IntoIterator<Item = Signal>,
        restart: impl IntoIterator<Item = Signal>,
    ) -> Result<Self, ConfigError> {
        Self::with_defaults(stop, restart, &Defaults::platform())
    }

    /// Build a registry, falling back to `defaults` for any empty set.
    ///
    /// Both actions must end up with at least one signal, no signal may be
    /// bound to both, and every signal must be catchable.
    pub fn with_defaults(
        stop: impl IntoIterator<Item = Signal>,
        restart: impl IntoIterator<Item = Signal>,
        defaults: &Defaults,
    ) -> Result<Self, ConfigError> {
        let mut stop: Vec<Signal> = stop.into_iter().collect();
        if stop.is_empty() {
            stop = defaults.stop.clone();
        }
        let mut restart: Vec<Signal> = restart.into_iter().collect();
        if restart.is_empty() {
            restart = defaults.restart.clone();
        }

        if stop.is_empty() {
            return Err(ConfigError::NoStopSignal);
        }
        if restart.is_empty() {
            return Err(ConfigError::NoRestartSignal);
        }

        let mut actions = HashMap::with_capacity(stop.len() + restart.len());
        for signal in stop {
            if !signal.is_catchable() {
                return Err(ConfigError::UncatchableSignal(signal));
            }
            actions.insert(signal, Action::Stop);
        }
        for signal in restart {
            if !signal.is_catchable() {
                return Err(ConfigError::UncatchableSignal(signal));
            }
            if actions.get(&signal) == Some(&Action::Stop) {
                return Err(ConfigError::ConflictingSignal(signal));
            }
            actions.insert(signal, Action::Restart);
        }

        Ok(Self { actions })
    }

    /// The action bound to `signal`, if any.
    pub fn lookup(&self, signal: Signal) -> Option<Action> {
        self.actions.get(&signal).copied()
    }

    /// Every registered signal, sorted by number.
    pub fn signals(&self) -> Vec<Signal> {
        let mut signals: Vec<Signal> = self.actions.keys().copied().collect();
        signals.sort();
        signals
    }

    /// Signals bound to `action`, sorted by number.
    pub fn signals_for(&self, action: Action) -> Vec<Signal> {
        let mut signals: Vec<Signal> = self
            .actions
            .iter()
            .filter(|(_, bound)| **bound == action)
            .map(|(signal, _)| *signal)
            .collect();
        signals.sort();
        signals
    }
}
