//! Domain-specific error types for the IPU slot manager.
//!
//! All fallible operations return `Result<T, IpuError>`.
//! Hardware-reported faults are not errors here: they are recorded in the
//! sticky error status and surfaced through the wait channel instead.

use std::time::Duration;
use thiserror::Error;

use crate::layout::RegionId;

/// The canonical error type for the slot manager.
#[derive(Debug, Error)]
pub enum IpuError {
    // ── Layout Errors ────────────────────────────────────────────
    /// The enabled output regions do not fit in one slot.
    #[error("layout overflow at {stage}: cursor {cursor:#x} reaches slot budget {limit:#x}")]
    LayoutOverflow {
        stage: RegionId,
        cursor: u64,
        limit: u64,
    },

    /// The pipeline configuration is self-contradictory.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The memory pool cannot hold the requested slots.
    #[error("invalid pool geometry: {0}")]
    InvalidPool(&'static str),

    // ── Ownership Errors ─────────────────────────────────────────
    /// A slot id outside `0..slot_count`.
    #[error("slot {0} does not exist")]
    InvalidSlot(usize),

    /// Completion or error was reported for a slot the hardware does not own.
    #[error("slot {0} is not busy")]
    SlotNotBusy(usize),

    /// The consumer acknowledged a slot that holds no completed frame.
    #[error("slot {0} is not done")]
    SlotNotDone(usize),

    /// No free slot was available to arm the hardware.
    #[error("no free slot available")]
    NoFreeSlot,

    /// The surface is not written by the installed configuration.
    #[error("region {0} is not written")]
    RegionNotWritten(RegionId),

    /// A read started past the end of a plane.
    #[error("offset {offset:#x} is past the end of {region} ({size:#x} bytes)")]
    PlaneOutOfRange {
        region: RegionId,
        offset: u64,
        size: u64,
    },

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The pipeline has never been initialised.
    #[error("pipeline is not initialised")]
    NotInitialized,

    /// A phase transition was requested from the wrong phase.
    #[error("invalid pipeline transition: {0}")]
    InvalidTransition(&'static str),

    /// A hardware memory access fell outside the mapped pool.
    #[error("memory access {addr:#x}+{len} is outside the mapped pool")]
    MemoryOutOfRange { addr: u64, len: usize },

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the control magic.
    #[error("invalid magic bytes: expected IPU0")]
    InvalidMagic,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The packet payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The daemon rejected a request and sent back its reason.
    #[error("remote error: {0}")]
    Remote(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for IpuError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        IpuError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for IpuError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        IpuError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = IpuError::LayoutOverflow {
            stage: RegionId::Scale,
            cursor: 0x20_0000,
            limit: 0x10_0000,
        };
        let text = e.to_string();
        assert!(text.contains("scale"));
        assert!(text.contains("0x100000"));

        let e = IpuError::SlotNotBusy(3);
        assert_eq!(e.to_string(), "slot 3 is not busy");
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: IpuError = io_err.into();
        assert!(matches!(e, IpuError::Connection(_)));
    }

    #[test]
    fn from_send_error() {
        let e: IpuError = tokio::sync::mpsc::error::SendError(1u8).into();
        assert!(matches!(e, IpuError::ChannelClosed));
    }
}
