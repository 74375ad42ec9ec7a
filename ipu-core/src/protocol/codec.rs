use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::header::{ControlHeader, HEADER_SIZE};
use super::packet::{MAX_PAYLOAD_SIZE, Packet};
use crate::error::IpuError;

/// Frames [`Packet`]s on a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = Packet;
    type Error = IpuError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = ControlHeader::decode(&src[..HEADER_SIZE])?;
        let payload_len = header.payload_length as usize;
        if header.payload_length > MAX_PAYLOAD_SIZE as u64 {
            return Err(IpuError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if payload_len > 0 && header.checksum == 0 {
            return Err(IpuError::ProtocolViolation("payload without checksum"));
        }

        let frame_len = HEADER_SIZE + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        Packet::from_parts(header, payload).map(Some)
    }
}

impl Encoder<Packet> for ControlCodec {
    type Error = IpuError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.encoded_len());
        item.header().encode(dst);
        dst.extend_from_slice(item.payload());
        Ok(())
    }
}
