//! Message types and command identifiers carried in the frame header.
//!
//! Uses proper enums with `TryFrom`; unknown values are errors, not panics.

use std::fmt;

use crate::error::IpuError;

// ── MessageType ──────────────────────────────────────────────────

/// Distinguishes requests (supervisor → daemon) from responses.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request = 0x1,
    Response = 0x2,
}

impl TryFrom<u32> for MessageType {
    type Error = IpuError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(MessageType::Request),
            0x2 => Ok(MessageType::Response),
            _ => Err(IpuError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Request => write!(f, "Request"),
            MessageType::Response => write!(f, "Response"),
        }
    }
}

// ── Command ──────────────────────────────────────────────────────

/// Every control call understood by the daemon.
///
/// Organized by category:
/// - `0x00xx`: protocol
/// - `0x01xx`: pipeline lifecycle
/// - `0x02xx`: consumer calls
/// - `0x03xx`: introspection
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // ── Protocol (0x00xx) ────────────────────────────────────────
    Ping = 0x0001,

    // ── Lifecycle (0x01xx) ───────────────────────────────────────
    Init = 0x0101,
    Start = 0x0102,
    Stop = 0x0103,
    Reconfigure = 0x0104,

    // ── Consumer (0x02xx) ────────────────────────────────────────
    Acknowledge = 0x0201,
    FetchDoneDescriptor = 0x0202,
    FetchErrorStatus = 0x0203,
    /// Blocks until a wake reason is available.
    WaitEvent = 0x0204,
    PollEvent = 0x0205,
    /// Reads bytes out of a done slot.
    ReadRegion = 0x0206,

    // ── Introspection (0x03xx) ───────────────────────────────────
    MemInfo = 0x0301,
    RegionTable = 0x0302,
    Status = 0x0303,
    DumpRegisters = 0x0304,
}

impl TryFrom<u32> for Command {
    type Error = IpuError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0001 => Command::Ping,
            0x0101 => Command::Init,
            0x0102 => Command::Start,
            0x0103 => Command::Stop,
            0x0104 => Command::Reconfigure,
            0x0201 => Command::Acknowledge,
            0x0202 => Command::FetchDoneDescriptor,
            0x0203 => Command::FetchErrorStatus,
            0x0204 => Command::WaitEvent,
            0x0205 => Command::PollEvent,
            0x0206 => Command::ReadRegion,
            0x0301 => Command::MemInfo,
            0x0302 => Command::RegionTable,
            0x0303 => Command::Status,
            0x0304 => Command::DumpRegisters,
            _ => {
                return Err(IpuError::UnknownVariant {
                    type_name: "Command",
                    value: value as u64,
                });
            }
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
