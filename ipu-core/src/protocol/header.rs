//! Fixed-size frame header.
//!
//! ```text
//!  0        4          8              12         16           24              32
//!  ┌────────┬──────────┬──────────────┬──────────┬────────────┬───────────────┐
//!  │ "IPU0" │ checksum │ message_type │ command  │ request_id │ payload_length│
//!  │  u32   │   u32    │     u32      │   u32    │    u64     │      u64      │
//!  └────────┴──────────┴──────────────┴──────────┴────────────┴───────────────┘
//! ```
//!
//! All fields are little-endian.

use bytes::{Buf, BufMut};

use super::message::{Command, MessageType};
use crate::error::IpuError;

/// Magic prefix of every frame.
pub const MAGIC: [u8; 4] = *b"IPU0";

/// Encoded header length in bytes.
pub const HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// First four bytes of the payload's blake3 hash, zero for no payload.
    pub checksum: u32,
    pub message_type: MessageType,
    pub command: Command,
    pub request_id: u64,
    pub payload_length: u64,
}

impl ControlHeader {
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&MAGIC);
        dst.put_u32_le(self.checksum);
        dst.put_u32_le(self.message_type as u32);
        dst.put_u32_le(self.command as u32);
        dst.put_u64_le(self.request_id);
        dst.put_u64_le(self.payload_length);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `src`.
    pub fn decode(mut src: &[u8]) -> Result<Self, IpuError> {
        if src.len() < HEADER_SIZE {
            return Err(IpuError::ProtocolViolation("truncated header"));
        }
        if src[..4] != MAGIC {
            return Err(IpuError::InvalidMagic);
        }
        src.advance(4);

        let checksum = src.get_u32_le();
        let message_type = MessageType::try_from(src.get_u32_le())?;
        let command = Command::try_from(src.get_u32_le())?;
        let request_id = src.get_u64_le();
        let payload_length = src.get_u64_le();

        Ok(Self {
            checksum,
            message_type,
            command,
            request_id,
            payload_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ControlHeader {
        ControlHeader {
            checksum: 0xdead_beef,
            message_type: MessageType::Request,
            command: Command::Acknowledge,
            request_id: 42,
            payload_length: 9,
        }
    }

    #[test]
    fn layout_is_fixed() {
        let bytes = header().to_bytes();
        assert_eq!(&bytes[..4], b"IPU0");
        assert_eq!(&bytes[4..8], &0xdead_beefu32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0x0201u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &42u64.to_le_bytes());
        assert_eq!(ControlHeader::decode(&bytes).unwrap(), header());
    }

    #[test]
    fn rejects_bad_magic_and_short_input() {
        let mut bytes = header().to_bytes();
        assert!(ControlHeader::decode(&bytes[..HEADER_SIZE - 1]).is_err());
        bytes[0] = b'X';
        assert!(matches!(
            ControlHeader::decode(&bytes),
            Err(IpuError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_unknown_command() {
        let mut bytes = header().to_bytes();
        bytes[12..16].copy_from_slice(&0x7777u32.to_le_bytes());
        assert!(matches!(
            ControlHeader::decode(&bytes),
            Err(IpuError::UnknownVariant { .. })
        ));
    }
}
