//! HEARTBEAT payload: server clock and load.
//!
//! ```text
//! timestamp_low:   u32  (4)   ms since epoch, low half
//! timestamp_high:  u32  (4)   ms since epoch, high half
//! server_load:     f32  (4)
//! ```

use crate::error::ProtocolError;
use crate::header::{read_f32, read_u32};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatPayload {
    pub timestamp_ms: u64,
    pub server_load: f32,
}

impl HeartbeatPayload {
    /// Encoded size on the wire.
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(self.timestamp_ms as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&((self.timestamp_ms >> 32) as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.server_load.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::PayloadTooShort {
                kind: "heartbeat",
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let low = read_u32(data, 0) as u64;
        let high = read_u32(data, 4) as u64;
        Ok(Self {
            timestamp_ms: (high << 32) | low,
            server_load: read_f32(data, 8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_halves_recombine() {
        let hb = HeartbeatPayload {
            timestamp_ms: 1_760_000_000_123,
            server_load: 0.42,
        };
        let bytes = hb.encode();
        assert_eq!(HeartbeatPayload::decode(&bytes).unwrap(), hb);
        // Low half first.
        assert_eq!(
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            1_760_000_000_123u64 as u32
        );
    }

    #[test]
    fn heartbeat_too_short() {
        assert!(HeartbeatPayload::decode(&[0u8; 11]).is_err());
    }
}
