//! Wire enumerants: message types, compression codes and pixel dtypes.
//!
//! Uses proper enums with `TryFrom`; unknown values are errors, never panics.

use std::fmt;

use crate::error::ProtocolError;

// ── MessageType ──────────────────────────────────────────────────

/// Kind of payload carried by a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// One slice of pixel data plus its sub-header.
    SliceData = 0x01,
    /// UTF-8 JSON describing a volume.
    Metadata = 0x02,
    /// UTF-8 JSON describing a server-side failure.
    Error = 0x03,
    /// Server liveness beacon with a load figure.
    Heartbeat = 0x04,
    /// Acknowledgement; the payload carries no defined structure.
    Ack = 0x05,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(MessageType::SliceData),
            0x02 => Ok(MessageType::Metadata),
            0x03 => Ok(MessageType::Error),
            0x04 => Ok(MessageType::Heartbeat),
            0x05 => Ok(MessageType::Ack),
            _ => Err(ProtocolError::UnknownVariant {
                type_name: "MessageType",
                value: value as u32,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::SliceData => "SLICE_DATA",
            MessageType::Metadata => "METADATA",
            MessageType::Error => "ERROR",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Ack => "ACK",
        };
        f.write_str(name)
    }
}

// ── CompressionType ──────────────────────────────────────────────

/// Payload compression code.
///
/// The framing reserves three codecs, but only [`CompressionType::None`]
/// is implemented. Frames using the others are rejected at decode time.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionType {
    #[default]
    None = 0x00,
    Zlib = 0x01,
    Lz4 = 0x02,
    Zstd = 0x03,
}

impl TryFrom<u8> for CompressionType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(CompressionType::None),
            0x01 => Ok(CompressionType::Zlib),
            0x02 => Ok(CompressionType::Lz4),
            0x03 => Ok(CompressionType::Zstd),
            _ => Err(ProtocolError::UnknownVariant {
                type_name: "CompressionType",
                value: value as u32,
            }),
        }
    }
}

// ── DType ────────────────────────────────────────────────────────

/// Numeric element type of a slice's pixel buffer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Uint8 = 0x01,
    Uint16 = 0x02,
    Int16 = 0x03,
    Float32 = 0x04,
    Float64 = 0x05,
}

impl DType {
    /// Bytes occupied by one element on the wire.
    pub const fn element_size(self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Uint16 | DType::Int16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for DType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(DType::Uint8),
            0x02 => Ok(DType::Uint16),
            0x03 => Ok(DType::Int16),
            0x04 => Ok(DType::Float32),
            0x05 => Ok(DType::Float64),
            _ => Err(ProtocolError::UnknownVariant {
                type_name: "DType",
                value,
            }),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Int16 => "int16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };
        f.write_str(name)
    }
}
