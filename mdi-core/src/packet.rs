//! A framed wire message: validated header plus raw payload bytes.
//!
//! `Packet` enforces the framing half of the decode contract (length,
//! magic, version, declared length, CRC). Interpreting the payload is the
//! codec's job.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::header::{FrameHeader, HEADER_SIZE};
use crate::message::{CompressionType, MessageType};

/// Upper bound for a single frame accepted by the stream decoder (256 MiB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// CRC32 (reflected IEEE 802.3, poly 0xEDB88320) of `data`.
///
/// Stateless; safe to call from any number of threads.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[derive(Debug, Clone)]
pub struct Packet {
    header: FrameHeader,
    payload: Bytes,
}

impl Packet {
    /// Build an uncompressed packet, computing the payload CRC.
    pub fn new(
        message_type: MessageType,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let header = FrameHeader::new(
            message_type,
            CompressionType::None,
            length,
            sequence,
            checksum(&payload),
        );
        Ok(Self { header, payload })
    }

    /// Parse a complete frame.
    ///
    /// The payload is a zero-copy slice of `frame`. Bytes past the declared
    /// payload length are ignored.
    pub fn from_bytes(frame: Bytes) -> Result<Self, ProtocolError> {
        let header = FrameHeader::from_bytes(&frame)?;

        let available = frame.len() - HEADER_SIZE;
        let declared = header.payload_length();
        if declared > available {
            return Err(ProtocolError::IncompleteMessage {
                declared,
                available,
            });
        }

        let payload = frame.slice(HEADER_SIZE..HEADER_SIZE + declared);
        let actual = checksum(&payload);
        if actual != header.crc32() {
            return Err(ProtocolError::CrcMismatch {
                expected: header.crc32(),
                actual,
            });
        }

        Ok(Self { header, payload })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence()
    }

    /// Recompute the payload CRC and compare it with the header.
    pub fn validate(&self) -> bool {
        checksum(&self.payload) == self.header.crc32()
    }
}
