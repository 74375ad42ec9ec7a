//! Control calls carried over a [`Connection`]: request and response bodies,
//! the daemon-side dispatcher and a typed client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionInfo, ConnectionSender};
use super::message::{Command, MessageType};
use super::packet::Packet;
use crate::config::Configuration;
use crate::device::{DeviceStatus, IpuDevice, WakeReason};
use crate::error::IpuError;
use crate::layout::{Plane, RegionId, RegionTable};
use crate::processor::EventMask;
use crate::slot::{PoolGeometry, SlotDescriptor};

/// Largest number of bytes one `ReadRegion` reply carries.
pub const MAX_READ_CHUNK: usize = 512 * 1024;

// ── Bodies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    Ping,
    Init(Configuration),
    Start,
    Stop,
    Reconfigure(Configuration),
    Acknowledge { slot_id: u64 },
    FetchDoneDescriptor,
    FetchErrorStatus,
    WaitEvent,
    PollEvent,
    /// Read up to `len` bytes of one plane of a done slot.
    ReadRegion {
        slot_id: u64,
        region: RegionId,
        plane: Plane,
        offset: u64,
        len: u64,
    },
    MemInfo,
    RegionTable,
    Status,
    DumpRegisters,
}

impl ControlRequest {
    pub fn command(&self) -> Command {
        match self {
            Self::Ping => Command::Ping,
            Self::Init(_) => Command::Init,
            Self::Start => Command::Start,
            Self::Stop => Command::Stop,
            Self::Reconfigure(_) => Command::Reconfigure,
            Self::Acknowledge { .. } => Command::Acknowledge,
            Self::FetchDoneDescriptor => Command::FetchDoneDescriptor,
            Self::FetchErrorStatus => Command::FetchErrorStatus,
            Self::WaitEvent => Command::WaitEvent,
            Self::PollEvent => Command::PollEvent,
            Self::ReadRegion { .. } => Command::ReadRegion,
            Self::MemInfo => Command::MemInfo,
            Self::RegionTable => Command::RegionTable,
            Self::Status => Command::Status,
            Self::DumpRegisters => Command::DumpRegisters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Pong,
    Done,
    Descriptor(Option<SlotDescriptor>),
    ErrorStatus(EventMask),
    Event(WakeReason),
    Ready(Option<WakeReason>),
    MemInfo(PoolGeometry),
    Regions(Option<RegionTable>),
    Status(DeviceStatus),
    Data(Vec<u8>),
    Registers(Vec<(String, u64)>),
    /// The call failed; carries the error text.
    Failed(String),
}

impl From<Result<(), IpuError>> for ControlResponse {
    fn from(result: Result<(), IpuError>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

// ── Server side ──────────────────────────────────────────────────

/// Execute one request against `device`.
pub async fn dispatch(device: &IpuDevice, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Ping => ControlResponse::Pong,
        ControlRequest::Init(cfg) => device.init(cfg).into(),
        ControlRequest::Start => device.start().into(),
        ControlRequest::Stop => {
            device.stop();
            ControlResponse::Done
        }
        ControlRequest::Reconfigure(cfg) => device.reconfigure(cfg).into(),
        ControlRequest::Acknowledge { slot_id } => slot_index(slot_id)
            .and_then(|id| device.acknowledge(id))
            .into(),
        ControlRequest::FetchDoneDescriptor => {
            ControlResponse::Descriptor(device.fetch_done_descriptor())
        }
        ControlRequest::FetchErrorStatus => {
            ControlResponse::ErrorStatus(device.fetch_error_status())
        }
        ControlRequest::WaitEvent => ControlResponse::Event(device.wait_event().await),
        ControlRequest::PollEvent => ControlResponse::Ready(device.poll_event()),
        ControlRequest::ReadRegion {
            slot_id,
            region,
            plane,
            offset,
            len,
        } => {
            let len = usize::try_from(len).map_or(MAX_READ_CHUNK, |len| len.min(MAX_READ_CHUNK));
            match slot_index(slot_id)
                .and_then(|id| device.read_region(id, region, plane, offset, len))
            {
                Ok(bytes) => ControlResponse::Data(bytes),
                Err(e) => ControlResponse::Failed(e.to_string()),
            }
        }
        ControlRequest::MemInfo => ControlResponse::MemInfo(device.mem_info()),
        ControlRequest::RegionTable => ControlResponse::Regions(device.region_table()),
        ControlRequest::Status => ControlResponse::Status(device.status()),
        ControlRequest::DumpRegisters => ControlResponse::Registers(device.dump_registers()),
    }
}

/// Slot ids travel as `u64`; ids that do not fit a `usize` cannot exist.
fn slot_index(slot_id: u64) -> Result<usize, IpuError> {
    usize::try_from(slot_id).map_err(|_| IpuError::InvalidSlot(usize::MAX))
}

/// Serve requests from one connection until the peer disconnects.
///
/// Each request runs in its own task so a blocking `WaitEvent` never holds
/// up other calls on the same connection. Outstanding requests are aborted
/// when the connection closes.
pub async fn serve_connection(conn: Connection, device: Arc<IpuDevice>) {
    let peer = conn.peer();
    let (tx, mut rx) = conn.into_split();
    let mut in_flight = JoinSet::new();
    info!(?peer, "control client connected");

    loop {
        tokio::select! {
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                if packet.message_type() != MessageType::Request {
                    warn!(?peer, command = %packet.command(), "ignoring non-request packet");
                    continue;
                }
                in_flight.spawn(handle_request(packet, device.clone(), tx.clone()));
            }
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = result {
                    warn!(?peer, error = %e, "request task failed");
                }
            }
        }
    }

    in_flight.shutdown().await;
    info!(?peer, "control client disconnected");
}

async fn handle_request(packet: Packet, device: Arc<IpuDevice>, tx: ConnectionSender) {
    let request_id = packet.request_id();
    let command = packet.command();

    let response = match packet.body::<ControlRequest>() {
        Ok(request) if request.command() == command => {
            debug!(request_id, %command, "control request");
            dispatch(&device, request).await
        }
        Ok(_) => ControlResponse::Failed(
            IpuError::ProtocolViolation("command does not match body").to_string(),
        ),
        Err(e) => ControlResponse::Failed(e.to_string()),
    };

    let reply = match Packet::response(request_id, command, &response) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(request_id, error = %e, "failed to encode response");
            return;
        }
    };
    if tx.send(reply).await.is_err() {
        debug!(request_id, "connection closed before reply");
    }
}

// ── Client side ──────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Packet>>>>;

/// Typed client for a remote daemon.
///
/// Requests may be issued concurrently; replies are matched by request id.
#[derive(Debug)]
pub struct ControlClient {
    tx: ConnectionSender,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl ControlClient {
    /// Default deadline for every call except [`wait_event`](Self::wait_event).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub async fn connect(info: &ConnectionInfo) -> Result<Self, IpuError> {
        Ok(Self::new(Connection::connect(info).await?))
    }

    pub fn new(conn: Connection) -> Self {
        let (tx, mut rx) = conn.into_split();
        let pending: PendingMap = Arc::default();

        let replies = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let waiter = replies
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&packet.request_id());
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(packet);
                    }
                    None => debug!(request_id = packet.request_id(), "unsolicited reply"),
                }
            }
            // Dropping the senders fails every outstanding call.
            replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        Self {
            tx,
            pending,
            next_id: AtomicU64::new(1),
            timeout: Self::DEFAULT_TIMEOUT,
            reader,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request` and wait for its reply.
    pub async fn call(&self, request: ControlRequest) -> Result<ControlResponse, IpuError> {
        let blocking = matches!(request, ControlRequest::WaitEvent);
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let packet = Packet::request(request_id, request.command(), &request)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, reply_tx);

        let result = self.round_trip(packet, reply_rx, blocking).await;
        if result.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
        }
        match result?.body()? {
            ControlResponse::Failed(reason) => Err(IpuError::Remote(reason)),
            response => Ok(response),
        }
    }

    async fn round_trip(
        &self,
        packet: Packet,
        reply: oneshot::Receiver<Packet>,
        blocking: bool,
    ) -> Result<Packet, IpuError> {
        self.tx.send(packet).await?;
        let reply = async move { reply.await.map_err(|_| IpuError::ChannelClosed) };
        if blocking {
            reply.await
        } else {
            tokio::time::timeout(self.timeout, reply)
                .await
                .map_err(|_| IpuError::Timeout(self.timeout))?
        }
    }

    // ── Typed calls ──────────────────────────────────────────────

    pub async fn ping(&self) -> Result<(), IpuError> {
        match self.call(ControlRequest::Ping).await? {
            ControlResponse::Pong => Ok(()),
            _ => Err(unexpected()),
        }
    }

    pub async fn init(&self, cfg: Configuration) -> Result<(), IpuError> {
        self.expect_done(ControlRequest::Init(cfg)).await
    }

    pub async fn start(&self) -> Result<(), IpuError> {
        self.expect_done(ControlRequest::Start).await
    }

    pub async fn stop(&self) -> Result<(), IpuError> {
        self.expect_done(ControlRequest::Stop).await
    }

    pub async fn reconfigure(&self, cfg: Configuration) -> Result<(), IpuError> {
        self.expect_done(ControlRequest::Reconfigure(cfg)).await
    }

    pub async fn acknowledge(&self, slot_id: usize) -> Result<(), IpuError> {
        self.expect_done(ControlRequest::Acknowledge {
            slot_id: slot_id as u64,
        })
        .await
    }

    pub async fn fetch_done_descriptor(&self) -> Result<Option<SlotDescriptor>, IpuError> {
        match self.call(ControlRequest::FetchDoneDescriptor).await? {
            ControlResponse::Descriptor(desc) => Ok(desc),
            _ => Err(unexpected()),
        }
    }

    pub async fn fetch_error_status(&self) -> Result<EventMask, IpuError> {
        match self.call(ControlRequest::FetchErrorStatus).await? {
            ControlResponse::ErrorStatus(mask) => Ok(mask),
            _ => Err(unexpected()),
        }
    }

    /// Block until the daemon reports a wake reason. No deadline applies.
    pub async fn wait_event(&self) -> Result<WakeReason, IpuError> {
        match self.call(ControlRequest::WaitEvent).await? {
            ControlResponse::Event(reason) => Ok(reason),
            _ => Err(unexpected()),
        }
    }

    pub async fn poll_event(&self) -> Result<Option<WakeReason>, IpuError> {
        match self.call(ControlRequest::PollEvent).await? {
            ControlResponse::Ready(reason) => Ok(reason),
            _ => Err(unexpected()),
        }
    }

    /// Read up to `len` bytes of one plane of a done slot. The reply is
    /// capped at [`MAX_READ_CHUNK`] bytes and stops at the end of the plane.
    pub async fn read_region(
        &self,
        slot_id: usize,
        region: RegionId,
        plane: Plane,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, IpuError> {
        let request = ControlRequest::ReadRegion {
            slot_id: slot_id as u64,
            region,
            plane,
            offset,
            len: len as u64,
        };
        match self.call(request).await? {
            ControlResponse::Data(bytes) => Ok(bytes),
            _ => Err(unexpected()),
        }
    }

    /// Read a whole plane of a done slot, one chunk per request.
    pub async fn read_plane(
        &self,
        slot_id: usize,
        region: RegionId,
        plane: Plane,
    ) -> Result<Vec<u8>, IpuError> {
        let table = self.region_table().await?.ok_or(IpuError::NotInitialized)?;
        let (_, size) = table.get(region).plane(plane);
        if size == 0 {
            return Err(IpuError::RegionNotWritten(region));
        }
        let mut data = Vec::new();
        while (data.len() as u64) < size {
            let chunk = self
                .read_region(slot_id, region, plane, data.len() as u64, MAX_READ_CHUNK)
                .await?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    pub async fn mem_info(&self) -> Result<PoolGeometry, IpuError> {
        match self.call(ControlRequest::MemInfo).await? {
            ControlResponse::MemInfo(geometry) => Ok(geometry),
            _ => Err(unexpected()),
        }
    }

    pub async fn region_table(&self) -> Result<Option<RegionTable>, IpuError> {
        match self.call(ControlRequest::RegionTable).await? {
            ControlResponse::Regions(table) => Ok(table),
            _ => Err(unexpected()),
        }
    }

    pub async fn status(&self) -> Result<DeviceStatus, IpuError> {
        match self.call(ControlRequest::Status).await? {
            ControlResponse::Status(status) => Ok(status),
            _ => Err(unexpected()),
        }
    }

    pub async fn dump_registers(&self) -> Result<Vec<(String, u64)>, IpuError> {
        match self.call(ControlRequest::DumpRegisters).await? {
            ControlResponse::Registers(registers) => Ok(registers),
            _ => Err(unexpected()),
        }
    }

    async fn expect_done(&self, request: ControlRequest) -> Result<(), IpuError> {
        match self.call(request).await? {
            ControlResponse::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected() -> IpuError {
    IpuError::ProtocolViolation("unexpected response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_commands_match_header_ids() {
        assert_eq!(ControlRequest::WaitEvent.command(), Command::WaitEvent);
        assert_eq!(
            ControlRequest::Acknowledge { slot_id: 1 }.command(),
            Command::Acknowledge
        );
        assert_eq!(
            ControlRequest::Init(Configuration::default()).command(),
            Command::Init
        );
        assert_eq!(
            ControlRequest::ReadRegion {
                slot_id: 0,
                region: RegionId::Downscale(1),
                plane: Plane::Chroma,
                offset: 0,
                len: 16,
            }
            .command(),
            Command::ReadRegion
        );
        assert_eq!(
            ControlRequest::DumpRegisters.command(),
            Command::DumpRegisters
        );
    }

    #[tokio::test]
    async fn out_of_range_slot_ids_fail_cleanly() {
        let geometry = PoolGeometry::new(0, 2 * 0x20_0000, 0x20_0000, 2).unwrap();
        let hw = Arc::new(crate::sim::SimHardware::new(geometry.base, geometry.size));
        let device = IpuDevice::open(hw, geometry);
        device.init(Configuration::hd_default()).unwrap();

        for slot_id in [2, u64::from(u32::MAX) + 1, u64::MAX] {
            let response = dispatch(&device, ControlRequest::Acknowledge { slot_id }).await;
            assert!(
                matches!(&response, ControlResponse::Failed(text) if text.contains("does not exist")),
                "{slot_id}: {response:?}"
            );
        }
        let response = dispatch(
            &device,
            ControlRequest::ReadRegion {
                slot_id: u64::MAX,
                region: RegionId::Crop,
                plane: Plane::Luma,
                offset: 0,
                len: u64::MAX,
            },
        )
        .await;
        assert!(matches!(response, ControlResponse::Failed(_)));
        device.shutdown().await;
    }

    #[test]
    fn bodies_survive_bincode() {
        let request = ControlRequest::Init(Configuration::hd_default());
        let packet = Packet::request(1, request.command(), &request).unwrap();
        assert_eq!(packet.body::<ControlRequest>().unwrap(), request);

        let response = ControlResponse::Event(WakeReason::Error(
            EventMask::BUS01_TRANSMIT_ERROR | EventMask::PYM_DS_FRAME_DROP,
        ));
        let packet = Packet::response(1, Command::WaitEvent, &response).unwrap();
        assert_eq!(packet.body::<ControlResponse>().unwrap(), response);
    }

    #[test]
    fn failures_carry_error_text() {
        let response: ControlResponse = Err(IpuError::NoFreeSlot).into();
        assert_eq!(
            response,
            ControlResponse::Failed("no free slot available".into())
        );
    }
}
