//! MDI frame codec.
//!
//! [`MdiCodec`] turns complete frames into [`DecodedFrame`]s and back. It
//! holds no mutable state, so one instance can be shared freely.
//!
//! For byte streams carrying back-to-back frames it also implements
//! `tokio_util::codec::{Decoder, Encoder}`. The stream decoder yields
//! `Result<DecodedFrame, ProtocolError>` items: a frame whose payload is
//! corrupt is reported and skipped, while framing failures (bad magic,
//! bad version, oversize) end the stream because frame boundaries are lost.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::debug;

use crate::error::ProtocolError;
use crate::header::{FrameHeader, HEADER_SIZE};
use crate::message::{CompressionType, MessageType};
use crate::packet::{MAX_FRAME_SIZE, Packet};
use crate::protocol::{DecodedFrame, HeartbeatPayload, Message, SliceDataPayload};

#[derive(Debug, Clone, Copy)]
pub struct MdiCodec {
    max_frame_size: usize,
}

impl Default for MdiCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MdiCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Limit applied by the stream decoder before buffering a frame.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max.max(HEADER_SIZE);
        self
    }

    // ── Decode ───────────────────────────────────────────────────

    /// Decode one complete frame.
    ///
    /// Order of checks: length, magic, version, declared length, CRC,
    /// compression, message type, payload structure. The first failure
    /// wins and nothing from the frame is returned.
    pub fn decode_frame(&self, frame: Bytes) -> Result<DecodedFrame, ProtocolError> {
        let packet = Packet::from_bytes(frame)?;
        let header = *packet.header();

        let payload = decompress(header.compression()?, packet.into_payload())?;

        let message = match header.message_type()? {
            MessageType::SliceData => Message::SliceData(SliceDataPayload::decode(payload)?),
            MessageType::Metadata => Message::Metadata(parse_json(&payload, "metadata")?),
            MessageType::Error => Message::Error(parse_json(&payload, "error")?),
            MessageType::Heartbeat => Message::Heartbeat(HeartbeatPayload::decode(&payload)?),
            MessageType::Ack => Message::Ack(payload),
        };

        debug!(
            sequence = header.sequence(),
            kind = %message.message_type(),
            bytes = header.frame_length(),
            "decoded frame"
        );

        Ok(DecodedFrame {
            sequence: header.sequence(),
            message,
        })
    }

    // ── Encode ───────────────────────────────────────────────────

    pub fn encode_message(&self, message: &Message, sequence: u32) -> Result<Bytes, ProtocolError> {
        let payload = match message {
            Message::SliceData(slice) => slice.encode()?,
            Message::Metadata(value) | Message::Error(value) => {
                Bytes::from(serde_json::to_vec(value)?)
            }
            Message::Heartbeat(hb) => Bytes::copy_from_slice(&hb.encode()),
            Message::Ack(payload) => payload.clone(),
        };
        Ok(Packet::new(message.message_type(), sequence, payload)?.to_bytes())
    }

    pub fn encode_slice(&self, slice: &SliceDataPayload, sequence: u32) -> Result<Bytes, ProtocolError> {
        Ok(Packet::new(MessageType::SliceData, sequence, slice.encode()?)?.to_bytes())
    }

    pub fn encode_metadata(&self, metadata: &Value, sequence: u32) -> Result<Bytes, ProtocolError> {
        Ok(Packet::new(MessageType::Metadata, sequence, serde_json::to_vec(metadata)?)?.to_bytes())
    }

    pub fn encode_error(&self, error: &Value, sequence: u32) -> Result<Bytes, ProtocolError> {
        Ok(Packet::new(MessageType::Error, sequence, serde_json::to_vec(error)?)?.to_bytes())
    }

    pub fn encode_heartbeat(&self, heartbeat: &HeartbeatPayload, sequence: u32) -> Result<Bytes, ProtocolError> {
        Ok(Packet::new(MessageType::Heartbeat, sequence, heartbeat.encode().to_vec())?.to_bytes())
    }
}

/// Only `None` is implemented; the reserved codecs fail loudly.
fn decompress(compression: CompressionType, payload: Bytes) -> Result<Bytes, ProtocolError> {
    match compression {
        CompressionType::None => Ok(payload),
        other => Err(ProtocolError::CompressionNotImplemented(other)),
    }
}

fn parse_json(payload: &[u8], kind: &'static str) -> Result<Value, ProtocolError> {
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8(kind))?;
    Ok(serde_json::from_str(text)?)
}

// ── Stream framing ───────────────────────────────────────────────

impl tokio_util::codec::Decoder for MdiCodec {
    type Item = Result<DecodedFrame, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::from_bytes(&src[..HEADER_SIZE])?;
        let frame_len = header.frame_length();
        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        Ok(Some(self.decode_frame(frame)))
    }
}

impl tokio_util::codec::Encoder<DecodedFrame> for MdiCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: DecodedFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = self.encode_message(&item.message, item.sequence)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
