//! Domain-specific error types for the MDI streaming core.
//!
//! All fallible operations return `Result<T, MdiError>`. Wire-level
//! failures are a [`ProtocolError`] and persistent-tier faults a
//! [`StorageError`]; both fold into `MdiError` via `#[from]`.

use std::time::Duration;
use thiserror::Error;

use crate::message::CompressionType;

/// The canonical error type for the MDI core.
#[derive(Debug, Error)]
pub enum MdiError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A single frame was malformed or corrupt. Fatal to that frame only.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // ── Transport Errors ─────────────────────────────────────────
    /// The WebSocket layer reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reconnection gave up after the configured number of attempts.
    #[error("reconnection attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    /// A connection state change was requested from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(&'static str),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The server answered a request with an ERROR message.
    #[error("server error: {0}")]
    Server(String),

    // ── Timeout ──────────────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Cache ────────────────────────────────────────────────────
    /// The persistent cache tier failed.
    #[error("cache storage error: {0}")]
    CacheStorage(#[from] StorageError),

    // ── Configuration ────────────────────────────────────────────
    /// An invalid option combination was requested.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Lifecycle ────────────────────────────────────────────────
    /// The owning component was torn down while the call was pending.
    #[error("terminated")]
    Terminated,

    /// The background execution context faulted while handling the call.
    #[error("worker fault: {0}")]
    WorkerFault(String),

    // ── Serialization ────────────────────────────────────────────
    /// Encoding of an outbound structured message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── ProtocolError ─────────────────────────────────────────────────

/// Typed wire-format failure.
///
/// Variants follow the decode order: length, magic, version, declared
/// length, CRC, compression, message type, then payload checks.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too short: {len} bytes (header is {min})")]
    TooShort { len: usize, min: usize },

    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("incomplete message: declared {declared} payload bytes, {available} available")]
    IncompleteMessage { declared: usize, available: usize },

    #[error("CRC mismatch: header {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("compression {0:?} not implemented")]
    CompressionNotImplemented(CompressionType),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} code: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u32 },

    #[error("{kind} payload too short: {actual} bytes (need {expected})")]
    PayloadTooShort {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid pixel data size: expected {expected} bytes, got {actual}")]
    InvalidPixelDataSize { expected: usize, actual: usize },

    #[error("file id is {0} bytes; the wire field holds 32")]
    FileIdTooLong(usize),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A `tokio_util` stream decoder hit an I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── StorageError ──────────────────────────────────────────────────

/// Fault raised by a persistent [`SliceStore`](crate::cache::SliceStore).
///
/// Local to the cache operation that hit it; other entries are untouched.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for MdiError {
    fn from(s: String) -> Self {
        MdiError::Other(s)
    }
}

impl From<&str> for MdiError {
    fn from(s: &str) -> Self {
        MdiError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MdiError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MdiError::ChannelClosed
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MdiError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        MdiError::Transport(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for StorageError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

impl MdiError {
    /// Returns `true` for errors that belong to one frame and leave the
    /// connection usable.
    pub fn is_protocol(&self) -> bool {
        matches!(self, MdiError::Protocol(_))
    }
}
