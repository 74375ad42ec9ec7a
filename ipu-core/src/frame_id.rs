//! Frame identifier extraction from pixel data.
//!
//! The pipeline stamps a sequence number into the first pixels of an output
//! plane so that consumers can correlate slots with capture order. Two
//! encodings exist:
//!
//! - **Bytes**: the first two bytes of the plane, big-endian.
//! - **Watermark**: eight consecutive 16-bit samples; a sample saturated to
//!   [`WATERMARK_SENTINEL`] is a 1 bit, anything else a 0 bit, MSB first.

use crate::config::FrameIdMode;

/// Sample value that encodes a 1 bit in watermark mode.
pub const WATERMARK_SENTINEL: u16 = 0xffff;

/// Samples carrying one watermark id.
pub const WATERMARK_SAMPLES: usize = 8;

/// Bytes that must be read from the plane to decode `mode`.
pub const fn stamp_len(mode: FrameIdMode) -> usize {
    match mode {
        FrameIdMode::Off => 0,
        FrameIdMode::Bytes => 2,
        FrameIdMode::Watermark => WATERMARK_SAMPLES * 2,
    }
}

/// Decode a big-endian two-byte id.
pub fn decode_bytes(bytes: &[u8]) -> Option<u32> {
    match bytes {
        [hi, lo, ..] => Some(u32::from(*hi) << 8 | u32::from(*lo)),
        _ => None,
    }
}

/// Decode a watermark from eight samples, MSB first.
pub fn decode_watermark(samples: &[u16; WATERMARK_SAMPLES]) -> u32 {
    samples
        .iter()
        .fold(0, |acc, &s| acc << 1 | u32::from(s == WATERMARK_SENTINEL))
}

/// Decode the id stamped at the start of `plane` using `mode`.
///
/// Watermark samples are read as little-endian 16-bit pixels. Returns `None`
/// for [`FrameIdMode::Off`] or when `plane` is too short.
pub fn decode(mode: FrameIdMode, plane: &[u8]) -> Option<u32> {
    match mode {
        FrameIdMode::Off => None,
        FrameIdMode::Bytes => decode_bytes(plane),
        FrameIdMode::Watermark => {
            let raw = plane.get(..WATERMARK_SAMPLES * 2)?;
            let mut samples = [0u16; WATERMARK_SAMPLES];
            for (sample, chunk) in samples.iter_mut().zip(raw.chunks_exact(2)) {
                *sample = u16::from_le_bytes([chunk[0], chunk[1]]);
            }
            Some(decode_watermark(&samples))
        }
    }
}

/// Produce the pixel bytes that stamp `id` in `mode`.
///
/// This is what the hardware writes; the simulator uses it to fake frames.
pub fn encode(mode: FrameIdMode, id: u32) -> Vec<u8> {
    match mode {
        FrameIdMode::Off => Vec::new(),
        FrameIdMode::Bytes => vec![(id >> 8) as u8, id as u8],
        FrameIdMode::Watermark => (0..WATERMARK_SAMPLES)
            .flat_map(|bit| {
                let set = (id >> (WATERMARK_SAMPLES - 1 - bit)) & 1 == 1;
                let sample = if set { WATERMARK_SENTINEL } else { 0x0080 };
                sample.to_le_bytes()
            })
            .collect(),
    }
}
