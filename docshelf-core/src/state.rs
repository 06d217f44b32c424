//! Connection lifecycle state shared between an adapter and its health monitor.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

/// Lifecycle of an adapter's connection.
///
/// `Disconnected -> Connecting -> Connected -> Validating -> (Available | Unavailable)`.
/// A failed connect goes straight from `Connecting` to `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Validating = 3,
    Available = 4,
    Unavailable = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Validating,
            4 => ConnectionState::Available,
            5 => ConnectionState::Unavailable,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Returns `true` once a connect attempt finished and probing has begun or ended.
    fn accepts_probe_result(&self) -> bool {
        matches!(
            self,
            ConnectionState::Validating | ConnectionState::Available | ConnectionState::Unavailable
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Validating => "validating",
            ConnectionState::Available => "available",
            ConnectionState::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// The only mutable state shared with the health monitor: the lifecycle state and
/// the `available` flag.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: AtomicU8,
    available: AtomicBool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            available: AtomicBool::new(false),
        }
    }
}

impl ConnectionStatus {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Moves to `state`. Leaving the probing states clears `available`.
    pub fn set_state(&self, state: ConnectionState) {
        if !matches!(state, ConnectionState::Available) {
            self.available.store(false, Ordering::Release);
        }
        self.state.store(state as u8, Ordering::Release);
        if matches!(state, ConnectionState::Available) {
            self.available.store(true, Ordering::Release);
        }
    }

    /// Records a probe result and returns the previous availability.
    ///
    /// Ignored unless the adapter is validating or already probed, so a probe
    /// finishing after `stop()` cannot mark a closed adapter available again.
    pub fn record_probe(&self, available: bool) -> Option<bool> {
        let next = if available {
            ConnectionState::Available
        } else {
            ConnectionState::Unavailable
        };

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ConnectionState::from_u8(current).accepts_probe_result() {
                return None;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(self.available.swap(available, Ordering::AcqRel))
    }
}
