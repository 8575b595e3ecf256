//! Connection state machine driven by the transport manager.
//!
//! Provides a `ConnectionState` enum that models the full lifecycle of
//! the slice-streaming socket, including automatic reconnection, with
//! validated transitions that return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::MdiError;

// ── ConnectionState ──────────────────────────────────────────────

/// The current state of the streaming connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲  ▲            │              │
///       │  │            ▼              ▼
///       │  └──────── Reconnecting ◄── (unexpected close)
///       │                 │
///       └──── Error ◄─────┘  (attempts exhausted)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket and no reconnection pending. Initial state.
    #[default]
    Disconnected,

    /// A socket open is in flight.
    Connecting,

    /// The socket is open and traffic flows.
    Connected {
        /// When the connection entered the `Connected` state.
        since: Instant,
    },

    /// Waiting out the backoff delay before the next attempt.
    Reconnecting {
        /// 1-based number of the attempt being waited for.
        attempt: u32,
    },

    /// Reconnection gave up. Only `connect()` leaves this state.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {attempt})"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// `true` while a connection is open or being opened.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected { .. })
    }

    /// How long the connection has been in the `Connected` state.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected`, `Reconnecting`, `Error`.
    pub fn begin_connect(&mut self) -> Result<(), MdiError> {
        match self {
            Self::Disconnected | Self::Reconnecting { .. } | Self::Error => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(MdiError::InvalidTransition(
                "cannot connect: already connecting or connected",
            )),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), MdiError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(MdiError::InvalidTransition(
                "cannot complete connect: not in Connecting state",
            )),
        }
    }

    /// Transition to `Reconnecting` after an unexpected close or a failed
    /// attempt.
    ///
    /// Valid from: `Connecting`, `Connected`, `Disconnected` (close observed
    /// after the socket was already dropped).
    pub fn schedule_reconnect(&mut self, attempt: u32) -> Result<(), MdiError> {
        match self {
            Self::Connecting | Self::Connected { .. } | Self::Disconnected => {
                *self = Self::Reconnecting { attempt };
                Ok(())
            }
            _ => Err(MdiError::InvalidTransition(
                "cannot schedule reconnect: already reconnecting or failed",
            )),
        }
    }

    /// Transition to `Error` once reconnection is exhausted.
    ///
    /// Valid from any state but `Error`.
    pub fn fail(&mut self) -> Result<(), MdiError> {
        match self {
            Self::Error => Err(MdiError::InvalidTransition("already in Error state")),
            _ => {
                *self = Self::Error;
                Ok(())
            }
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    ///
    /// Used by manual `disconnect()` and by unexpected closes when
    /// reconnection is disabled.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────
