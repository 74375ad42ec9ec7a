//! Remote control protocol.
//!
//! Supervising processes reach a daemon over TCP. Every frame is a fixed
//! [`ControlHeader`] followed by a `bincode` payload whose integrity is
//! covered by a truncated blake3 checksum. [`ControlRequest`] and
//! [`ControlResponse`] mirror the [`IpuDevice`](crate::device::IpuDevice)
//! control surface one call per command.

pub mod codec;
pub mod connection;
pub mod control;
pub mod header;
pub mod message;
pub mod packet;

pub use codec::ControlCodec;
pub use connection::{Connection, ConnectionInfo, ConnectionSender};
pub use control::{
    ControlClient, ControlRequest, ControlResponse, MAX_READ_CHUNK, dispatch, serve_connection,
};
pub use header::{ControlHeader, HEADER_SIZE};
pub use message::{Command, MessageType};
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};
