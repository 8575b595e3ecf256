//! Fixed 24-byte frame header.
//!
//! ```text
//! offset  size  field
//!      0     4  magic            0x004D4449 ("IDM\0" on the wire)
//!      4     2  version          1
//!      6     1  message_type
//!      7     1  compression
//!      8     4  payload_length
//!     12     4  sequence_number
//!     16     4  crc32            IEEE 802.3 over the payload
//!     20     4  reserved         0
//! ```
//!
//! All fields are little-endian.

use crate::error::ProtocolError;
use crate::message::{CompressionType, MessageType};

pub const MAGIC: u32 = 0x004D_4449;
pub const PROTOCOL_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 24;

pub type HeaderBytes = [u8; HEADER_SIZE];

/// Decoded frame header.
///
/// `message_type` and `compression` stay raw bytes here: the decode
/// contract checks the CRC before either is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    magic: u32,
    version: u16,
    message_type: u8,
    compression: u8,
    payload_length: u32,
    sequence: u32,
    crc32: u32,
    reserved: u32,
}

impl FrameHeader {
    pub fn new(
        message_type: MessageType,
        compression: CompressionType,
        payload_length: u32,
        sequence: u32,
        crc32: u32,
    ) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            message_type: message_type as u8,
            compression: compression as u8,
            payload_length,
            sequence,
            crc32,
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> HeaderBytes {
        let mut buf: HeaderBytes = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.message_type;
        buf[7] = self.compression;
        buf[8..12].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..20].copy_from_slice(&self.crc32.to_le_bytes());
        buf[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    /// Parse and validate the header prefix of `bytes`.
    ///
    /// Checks, in order: length, magic, version. Payload length, CRC and
    /// message type are validated by the codec.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                len: bytes.len(),
                min: HEADER_SIZE,
            });
        }

        let magic = read_u32(bytes, 0);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        Ok(Self {
            magic,
            version,
            message_type: bytes[6],
            compression: bytes[7],
            payload_length: read_u32(bytes, 8),
            sequence: read_u32(bytes, 12),
            crc32: read_u32(bytes, 16),
            reserved: read_u32(bytes, 20),
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn raw_message_type(&self) -> u8 {
        self.message_type
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.message_type)
    }

    pub fn raw_compression(&self) -> u8 {
        self.compression
    }

    pub fn compression(&self) -> Result<CompressionType, ProtocolError> {
        CompressionType::try_from(self.compression)
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length as usize
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Total frame size (header + payload) this header declares.
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}

/// Little-endian `u32` at `offset`. Callers guarantee the bounds.
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub(crate) fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32(bytes, offset))
}
