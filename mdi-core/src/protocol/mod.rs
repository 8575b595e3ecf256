//! Payload definitions for each MDI message kind.
//!
//! Binary frames carry one of the payloads below behind the 24-byte
//! header; text frames carry the JSON shapes in [`json`].

pub mod heartbeat;
pub mod json;
pub mod slice;

use bytes::Bytes;
use serde_json::Value;

pub use heartbeat::HeartbeatPayload;
pub use json::{ClientRequest, ServerText};
pub use slice::{Pixel, PixelBuffer, SliceDataPayload, TypedView, FILE_ID_LEN, SLICE_HEADER_SIZE};

use crate::message::MessageType;

/// A fully decoded binary message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SliceData(SliceDataPayload),
    Metadata(Value),
    Error(Value),
    Heartbeat(HeartbeatPayload),
    Ack(Bytes),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::SliceData(_) => MessageType::SliceData,
            Message::Metadata(_) => MessageType::Metadata,
            Message::Error(_) => MessageType::Error,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::Ack(_) => MessageType::Ack,
        }
    }
}

/// A decoded message with the sequence number it arrived under.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub sequence: u32,
    pub message: Message,
}
