//! Completion processing: the interrupt line and the single worker that
//! turns hardware events into slot transitions.
//!
//! ```text
//!  irq context                      worker task
//!  ───────────                      ───────────
//!  raise(mask)                      wait on wake
//!    pending |= mask      ───►      lock state
//!    wake.notify_one()              snapshot + clear pending
//!                                   errors → frame done → frame start
//!                                   notify consumers
//! ```
//!
//! The interrupt side never takes a lock. Every slot mutation happens on the
//! worker under the device state lock, so one wake's transitions are never
//! interleaved with another's.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Configuration, FrameIdMode};
use crate::device::{DeviceState, Shared};
use crate::frame_id;
use crate::hardware::IpuHardware;
use crate::layout::{RegionId, RegionTable};

bitflags! {
    /// Event bits reported by the pipeline interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u32 {
        /// The hardware latched the armed addresses and began a frame.
        const FRAME_START          = 1 << 0;
        /// The last pyramid layer of the current frame reached memory.
        const PYM_FRAME_DONE       = 1 << 1;
        const BUS01_TRANSMIT_ERROR = 1 << 2;
        const BUS23_TRANSMIT_ERROR = 1 << 3;
        const PYM_DS_FRAME_DROP    = 1 << 4;
        const PYM_US_FRAME_DROP    = 1 << 5;

        /// Bus faults; the written data cannot be trusted.
        const TRANSMIT_ERRORS = Self::BUS01_TRANSMIT_ERROR.bits()
            | Self::BUS23_TRANSMIT_ERROR.bits();
        /// Every bit that aborts the busy slot.
        const ERRORS = Self::TRANSMIT_ERRORS.bits()
            | Self::PYM_DS_FRAME_DROP.bits()
            | Self::PYM_US_FRAME_DROP.bits();
    }
}

// ── IrqState ─────────────────────────────────────────────────────

/// State shared between the interrupt line, the worker and the controller.
#[derive(Debug)]
pub(crate) struct IrqState {
    pending: AtomicU32,
    stopped: AtomicBool,
    pub(crate) wake: Notify,
}

impl IrqState {
    /// Starts stopped: events raised before the first `start` are dropped.
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            stopped: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    /// Set the stop flag, returning its previous value.
    pub(crate) fn set_stopped(&self, stopped: bool) -> bool {
        self.stopped.swap(stopped, Ordering::AcqRel)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.store(0, Ordering::Release);
    }

    /// Snapshot and clear the pending mask.
    pub(crate) fn take_pending(&self) -> EventMask {
        EventMask::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }
}

// ── InterruptLine ────────────────────────────────────────────────

/// Handle given to whatever delivers hardware interrupts.
///
/// [`raise`](Self::raise) never blocks and never allocates, so it is safe to
/// call from a signal-like context.
#[derive(Debug, Clone)]
pub struct InterruptLine {
    state: Arc<IrqState>,
}

impl InterruptLine {
    pub(crate) fn new(state: Arc<IrqState>) -> Self {
        Self { state }
    }

    /// Record `events` and wake the worker.
    pub fn raise(&self, events: EventMask) {
        if self.state.is_stopped() {
            self.state.clear_pending();
            return;
        }
        self.state.pending.fetch_or(events.bits(), Ordering::AcqRel);
        self.state.wake.notify_one();
    }
}

// ── PipelineStats ────────────────────────────────────────────────

/// Counters kept by the worker since the device was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Slots handed to the consumer.
    pub frames_done: u64,
    /// Wakes that carried at least one error bit.
    pub errors: u64,
    /// Frame starts that found no free slot.
    pub overruns: u64,
    /// Events that referred to a busy slot when none existed.
    pub inconsistencies: u64,
}

// ── Worker ───────────────────────────────────────────────────────

/// Spawn the completion worker. It runs until `cancel` fires.
pub(crate) fn spawn(shared: Arc<Shared>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("completion processor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.irq.wake.notified() => process_pending(&shared),
            }
        }
        debug!("completion processor exited");
    })
}

/// Handle everything raised since the last wake.
pub(crate) fn process_pending(shared: &Shared) {
    let mut guard = shared.lock();
    let events = shared.irq.take_pending();
    if events.is_empty() {
        return;
    }
    if shared.irq.is_stopped() {
        debug!(?events, "discarding events raised across stop");
        return;
    }

    let state = &mut *guard;
    let mut notify = on_error(shared, state, events);
    if events.contains(EventMask::PYM_FRAME_DONE) {
        notify |= on_frame_done(shared, state);
    }
    if events.contains(EventMask::FRAME_START) {
        on_frame_start(shared, state);
    }
    drop(guard);

    if notify {
        shared.events.notify_waiters();
    }
}

fn on_error(shared: &Shared, state: &mut DeviceState, events: EventMask) -> bool {
    let errors = events & EventMask::ERRORS;
    if errors.is_empty() {
        return false;
    }

    state.err_status |= errors;
    state.stats.errors += 1;
    error!(?errors, "ipu error");

    if errors.intersects(EventMask::TRANSMIT_ERRORS) {
        shared.controller.disable_paths();
        warn!("transfer paths disabled after bus error");
    }

    match state.registry.oldest_busy() {
        Some(id) => {
            if let Err(e) = state.registry.mark_error(id) {
                warn!(slot = id, error = %e, "failed to abort busy slot");
            } else {
                info!(slot = id, "busy slot aborted");
            }
        }
        None => {
            state.stats.inconsistencies += 1;
            warn!(?errors, "error raised with no busy slot");
        }
    }
    true
}

fn on_frame_done(shared: &Shared, state: &mut DeviceState) -> bool {
    let Some(id) = state.registry.oldest_busy() else {
        state.stats.inconsistencies += 1;
        warn!("frame done with no busy slot");
        return false;
    };

    let base = state.registry.slot_base(id);
    let (crop_id, scale_id) = match &state.config {
        Some(cfg) => read_frame_ids(shared.hw.as_ref(), cfg, state.registry.regions(), base),
        None => (0, 0),
    };

    match state.registry.mark_complete(id) {
        Ok(desc) => {
            desc.crop_frame_id = crop_id;
            desc.scale_frame_id = scale_id;
            debug!(slot = id, count = desc.use_count, crop_id, scale_id, "pyramid done");
        }
        Err(e) => {
            state.stats.inconsistencies += 1;
            warn!(slot = id, error = %e, "frame done for a slot that is not busy");
            return false;
        }
    }
    state.last_done = Some(id);
    state.stats.frames_done += 1;
    true
}

fn on_frame_start(shared: &Shared, state: &mut DeviceState) {
    match state.registry.acquire_for_pipeline() {
        Some(id) => {
            let base = state.registry.slot_base(id);
            shared.controller.program_slot(state.registry.regions(), base);
            debug!(slot = id, "slot armed");
        }
        None => {
            state.stats.overruns += 1;
            debug!("no free slot, hardware keeps its previous target");
        }
    }
}

// ── Frame ids ────────────────────────────────────────────────────

/// Decode the crop and scale frame ids stamped into the slot at `base`.
///
/// The scale id falls back to pyramid layer 0 when scale is not written.
/// Ids that cannot be read decode as zero.
fn read_frame_ids(
    hw: &dyn IpuHardware,
    cfg: &Configuration,
    regions: &RegionTable,
    base: u64,
) -> (u32, u32) {
    let mode = cfg.frame_id.mode;
    if mode == FrameIdMode::Off {
        return (0, 0);
    }

    let crop = if cfg.frame_id.crop && cfg.crop.to_ddr {
        read_frame_id(hw, mode, RegionId::Crop, regions, base)
    } else {
        0
    };
    let scale = if cfg.frame_id.scale {
        let source = if cfg.scale.to_ddr {
            RegionId::Scale
        } else {
            RegionId::Downscale(0)
        };
        read_frame_id(hw, mode, source, regions, base)
    } else {
        0
    };
    (crop, scale)
}

fn read_frame_id(
    hw: &dyn IpuHardware,
    mode: FrameIdMode,
    id: RegionId,
    regions: &RegionTable,
    base: u64,
) -> u32 {
    let region = regions.get(id);
    if region.is_empty() {
        return 0;
    }

    let mut buf = [0u8; frame_id::stamp_len(FrameIdMode::Watermark)];
    let buf = &mut buf[..frame_id::stamp_len(mode)];
    match hw.read_memory(base + region.y_offset, buf) {
        Ok(()) => frame_id::decode(mode, buf).unwrap_or(0),
        Err(e) => {
            warn!(region = %id, error = %e, "frame id read failed");
            0
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
