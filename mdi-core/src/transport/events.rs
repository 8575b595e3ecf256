//! Events emitted by the transport driver and the handler trait they
//! dispatch to.
//!
//! Events leave the driver through one ordered channel, so handlers see
//! them in arrival order for a given connection.

use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::MdiError;
use crate::protocol::{HeartbeatPayload, ServerText, SliceDataPayload};

#[derive(Debug)]
pub enum TransportEvent {
    /// The socket opened (initial connect or reconnect).
    Open,
    /// The socket closed. `manual` is set when `disconnect()` closed it.
    Close {
        code: Option<u16>,
        reason: String,
        manual: bool,
    },
    /// A connection attempt or the open socket failed.
    ConnectionError(MdiError),
    /// Reconnection is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    SliceData { sequence: u32, slice: SliceDataPayload },
    Metadata { sequence: u32, metadata: Value },
    Error { sequence: u32, error: Value },
    Heartbeat { sequence: u32, heartbeat: HeartbeatPayload },
    Ack { sequence: u32, payload: Bytes },
    /// Text `pong` reply to a ping.
    Pong { timestamp: Option<u64> },
    /// Any other text frame.
    Text(ServerText),
    /// A binary frame could not be decoded. The connection stays up.
    ProtocolError(MdiError),
}

/// Callback surface for transport events.
///
/// Every method defaults to a no-op, so implementors override only what
/// they care about.
#[allow(unused_variables)]
pub trait TransportHandler: Send {
    fn on_open(&mut self) {}
    fn on_close(&mut self, code: Option<u16>, reason: &str, manual: bool) {}
    fn on_connection_error(&mut self, error: &MdiError) {}
    fn on_reconnecting(&mut self, attempt: u32, delay: Duration) {}
    fn on_slice_data(&mut self, sequence: u32, slice: &SliceDataPayload) {}
    fn on_metadata(&mut self, sequence: u32, metadata: &Value) {}
    fn on_error(&mut self, sequence: u32, error: &Value) {}
    fn on_heartbeat(&mut self, sequence: u32, heartbeat: &HeartbeatPayload) {}
    fn on_ack(&mut self, sequence: u32, payload: &Bytes) {}
    fn on_pong(&mut self, timestamp: Option<u64>) {}
    fn on_text(&mut self, text: &ServerText) {}
    fn on_protocol_error(&mut self, error: &MdiError) {}
}

impl TransportEvent {
    /// Invoke the matching handler method.
    pub fn dispatch<H: TransportHandler + ?Sized>(&self, handler: &mut H) {
        match self {
            Self::Open => handler.on_open(),
            Self::Close {
                code,
                reason,
                manual,
            } => handler.on_close(*code, reason, *manual),
            Self::ConnectionError(e) => handler.on_connection_error(e),
            Self::Reconnecting { attempt, delay } => handler.on_reconnecting(*attempt, *delay),
            Self::SliceData { sequence, slice } => handler.on_slice_data(*sequence, slice),
            Self::Metadata { sequence, metadata } => handler.on_metadata(*sequence, metadata),
            Self::Error { sequence, error } => handler.on_error(*sequence, error),
            Self::Heartbeat {
                sequence,
                heartbeat,
            } => handler.on_heartbeat(*sequence, heartbeat),
            Self::Ack { sequence, payload } => handler.on_ack(*sequence, payload),
            Self::Pong { timestamp } => handler.on_pong(*timestamp),
            Self::Text(text) => handler.on_text(text),
            Self::ProtocolError(e) => handler.on_protocol_error(e),
        }
    }
}

/// Feed every event from `events` to `handler` until the driver stops.
/// Returns the handler so callers can inspect what it collected.
pub async fn run_handler<H: TransportHandler>(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut handler: H,
) -> H {
    while let Some(event) = events.recv().await {
        event.dispatch(&mut handler);
    }
    handler
}
