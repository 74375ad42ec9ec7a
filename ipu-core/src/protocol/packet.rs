use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::header::{ControlHeader, HEADER_SIZE};
use super::message::{Command, MessageType};
use crate::error::IpuError;

/// Largest payload accepted on the wire.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Largest frame accepted on the wire.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// First four bytes of the blake3 hash of `payload`; zero for no payload.
///
/// Zero is reserved for the empty payload, so a non-empty payload whose
/// truncated hash is zero carries 1 instead.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    non_zero(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

const fn non_zero(sum: u32) -> u32 {
    if sum == 0 { 1 } else { sum }
}

/// One framed message: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: ControlHeader,
    payload: Bytes,
}

impl Packet {
    pub fn new(
        message_type: MessageType,
        command: Command,
        request_id: u64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, IpuError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(IpuError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = ControlHeader {
            checksum: checksum(&payload),
            message_type,
            command,
            request_id,
            payload_length: payload.len() as u64,
        };
        Ok(Self { header, payload })
    }

    /// A request whose payload is `body` encoded with bincode.
    pub fn request<T: Serialize>(
        request_id: u64,
        command: Command,
        body: &T,
    ) -> Result<Self, IpuError> {
        Self::new(MessageType::Request, command, request_id, bincode::serialize(body)?)
    }

    /// A response whose payload is `body` encoded with bincode.
    pub fn response<T: Serialize>(
        request_id: u64,
        command: Command,
        body: &T,
    ) -> Result<Self, IpuError> {
        Self::new(MessageType::Response, command, request_id, bincode::serialize(body)?)
    }

    /// Reassemble a packet from a decoded header and its payload.
    pub(crate) fn from_parts(header: ControlHeader, payload: Bytes) -> Result<Self, IpuError> {
        if header.payload_length != payload.len() as u64 {
            return Err(IpuError::ProtocolViolation("payload length mismatch"));
        }
        let packet = Self { header, payload };
        packet.verify()?;
        Ok(packet)
    }

    /// Check the payload against the header checksum.
    pub fn verify(&self) -> Result<(), IpuError> {
        if checksum(&self.payload) == self.header.checksum {
            Ok(())
        } else {
            Err(IpuError::ChecksumMismatch)
        }
    }

    /// Decode the bincode payload.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, IpuError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn header(&self) -> &ControlHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn command(&self) -> Command {
        self.header.command
    }

    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
