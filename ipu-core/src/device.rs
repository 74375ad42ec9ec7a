//! The control surface: everything a supervising process can ask of the
//! slot manager.
//!
//! An [`IpuDevice`] owns the slot registry, the pipeline controller and the
//! completion worker. Control calls and the worker serialise on one state
//! lock that is never held across an `.await`. Consumers learn about new
//! work through [`IpuDevice::wait_event`], which resolves with one of three
//! [`WakeReason`]s.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::controller::{PipelineController, PipelinePhase};
use crate::error::IpuError;
use crate::hardware::IpuHardware;
use crate::layout::{LayoutPlanner, Plane, RegionId, RegionTable};
use crate::processor::{self, EventMask, InterruptLine, IrqState, PipelineStats};
use crate::slot::{PoolGeometry, SlotCounts, SlotDescriptor, SlotRegistry, SlotState};

// ── WakeReason ───────────────────────────────────────────────────

/// Why a waiting consumer was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeReason {
    /// At least one slot is done.
    SlotDone,
    /// The hardware reported errors; the mask is not cleared by waking.
    Error(EventMask),
    /// The pipeline is not running.
    Shutdown,
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotDone => write!(f, "slot done"),
            Self::Error(mask) => write!(f, "error {:#x}", mask.bits()),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Snapshot of the device for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub phase: PipelinePhase,
    pub counts: SlotCounts,
    /// Errors recorded but not yet fetched.
    pub error_status: EventMask,
    pub stats: PipelineStats,
}

// ── Shared state ─────────────────────────────────────────────────

/// Mutable state guarded by the device lock.
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) phase: PipelinePhase,
    pub(crate) config: Option<Configuration>,
    pub(crate) registry: SlotRegistry,
    pub(crate) err_status: EventMask,
    /// Slot most recently marked done by the worker.
    pub(crate) last_done: Option<usize>,
    pub(crate) stats: PipelineStats,
}

/// Everything the control surface and the worker both reach.
pub(crate) struct Shared {
    pub(crate) hw: Arc<dyn IpuHardware>,
    pub(crate) irq: Arc<IrqState>,
    pub(crate) controller: PipelineController,
    pub(crate) planner: LayoutPlanner,
    pub(crate) geometry: PoolGeometry,
    state: Mutex<DeviceState>,
    /// Consumers blocked in `wait_event`.
    pub(crate) events: Notify,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── IpuDevice ────────────────────────────────────────────────────

/// Slot manager for one image-pipeline unit.
pub struct IpuDevice {
    pub(crate) shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IpuDevice {
    /// Open the device over `hw` and spawn its completion worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(hw: Arc<dyn IpuHardware>, geometry: PoolGeometry) -> Self {
        let irq = Arc::new(IrqState::new());
        let shared = Arc::new(Shared {
            controller: PipelineController::new(hw.clone(), irq.clone()),
            hw,
            irq,
            planner: LayoutPlanner::new(geometry.slot_size),
            geometry,
            state: Mutex::new(DeviceState {
                phase: PipelinePhase::Uninitialized,
                config: None,
                registry: SlotRegistry::new(geometry.slot_size),
                err_status: EventMask::empty(),
                last_done: None,
                stats: PipelineStats::default(),
            }),
            events: Notify::new(),
        });

        let cancel = CancellationToken::new();
        let worker = processor::spawn(shared.clone(), cancel.clone());
        info!(
            base = geometry.base,
            slot_size = geometry.slot_size,
            slots = geometry.slot_count,
            "ipu device opened"
        );

        Self {
            shared,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Handle for delivering hardware interrupts to this device.
    pub fn interrupt_line(&self) -> InterruptLine {
        InterruptLine::new(self.shared.irq.clone())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Install `cfg`: stop, reset the module, program it and rebuild every
    /// slot as free. Leaves the pipeline stopped.
    ///
    /// The layout is planned first; on failure nothing changes.
    pub fn init(&self, cfg: Configuration) -> Result<(), IpuError> {
        let regions = self.shared.planner.plan(&cfg)?;

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        self.shared.controller.stop();
        state.phase.halt();

        self.shared.controller.reset(&cfg);
        let geometry = self.shared.geometry;
        let used = regions.used;
        state
            .registry
            .initialize(geometry.base, regions, geometry.slot_count);
        state.err_status = EventMask::empty();
        state.last_done = None;
        state.config = Some(cfg);
        state.phase.configured()?;
        drop(guard);

        self.shared.events.notify_waiters();
        info!(slots = geometry.slot_count, used, "ipu initialised");
        Ok(())
    }

    /// Arm the first slot and start the hardware. A no-op when running.
    pub fn start(&self) -> Result<(), IpuError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        match state.phase {
            PipelinePhase::Running => {
                debug!("start ignored: already running");
                return Ok(());
            }
            PipelinePhase::Uninitialized => return Err(IpuError::NotInitialized),
            PipelinePhase::Stopped => {}
        }
        let cfg = state.config.as_ref().ok_or(IpuError::NotInitialized)?;

        let id = state
            .registry
            .acquire_for_pipeline()
            .ok_or(IpuError::NoFreeSlot)?;
        self.shared
            .controller
            .program_slot(state.registry.regions(), state.registry.slot_base(id));
        self.shared.controller.start(cfg);
        state.phase.begin_running()
    }

    /// Disarm the hardware, return every slot to free and release waiters
    /// with [`WakeReason::Shutdown`]. Idempotent.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        self.shared.controller.stop();
        let was_running = state.phase.halt();
        let drained = state.registry.drain();
        state.last_done = None;
        drop(state);

        self.shared.events.notify_waiters();
        if was_running || drained > 0 {
            info!(drained, "pipeline stopped");
        }
    }

    /// Replace the running configuration: stop, reprogram without a module
    /// reset, rebuild the slots and start again.
    ///
    /// The new layout is planned first; on failure the pipeline is untouched.
    pub fn reconfigure(&self, cfg: Configuration) -> Result<(), IpuError> {
        let regions = self.shared.planner.plan(&cfg)?;

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.phase == PipelinePhase::Uninitialized {
            return Err(IpuError::NotInitialized);
        }
        self.shared.controller.stop();
        state.phase.halt();

        self.shared.controller.apply(&cfg);
        let geometry = self.shared.geometry;
        state
            .registry
            .initialize(geometry.base, regions, geometry.slot_count);
        state.last_done = None;
        state.phase.configured()?;
        let cfg = state.config.insert(cfg);

        let id = state
            .registry
            .acquire_for_pipeline()
            .ok_or(IpuError::NoFreeSlot)?;
        self.shared
            .controller
            .program_slot(state.registry.regions(), state.registry.slot_base(id));
        self.shared.controller.start(cfg);
        state.phase.begin_running()?;
        drop(guard);

        self.shared.events.notify_waiters();
        info!("pipeline reconfigured");
        Ok(())
    }

    // ── Consumer ─────────────────────────────────────────────────

    /// Return a done slot to free.
    pub fn acknowledge(&self, slot_id: usize) -> Result<(), IpuError> {
        self.shared.lock().registry.consume(slot_id)?;
        debug!(slot = slot_id, "slot acknowledged");
        Ok(())
    }

    /// Descriptor of the oldest done slot, if any.
    pub fn fetch_done_descriptor(&self) -> Option<SlotDescriptor> {
        let state = self.shared.lock();
        let desc = *state.registry.peek_done()?;
        if state.last_done != Some(desc.slot_id) {
            let counts = state.registry.counts();
            info!(
                slot = desc.slot_id,
                latest = ?state.last_done,
                done = counts.done,
                "consumer is lagging behind the pipeline"
            );
        }
        Some(desc)
    }

    /// Return and clear the recorded hardware errors.
    pub fn fetch_error_status(&self) -> EventMask {
        std::mem::replace(&mut self.shared.lock().err_status, EventMask::empty())
    }

    /// Non-blocking readiness check, in priority order: shutdown, error,
    /// slot done.
    pub fn poll_event(&self) -> Option<WakeReason> {
        let state = self.shared.lock();
        if !state.phase.is_running() {
            Some(WakeReason::Shutdown)
        } else if !state.err_status.is_empty() {
            Some(WakeReason::Error(state.err_status))
        } else if state.registry.peek_done().is_some() {
            Some(WakeReason::SlotDone)
        } else {
            None
        }
    }

    /// Sleep until a slot is done, an error is recorded or the pipeline
    /// stops.
    ///
    /// Returns immediately if one of those is already true. Cancel-safe.
    pub async fn wait_event(&self) -> WakeReason {
        loop {
            let notified = self.shared.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reason) = self.poll_event() {
                return reason;
            }
            notified.await;
        }
    }

    // ── Introspection ────────────────────────────────────────────

    /// Geometry of the reserved pool.
    pub fn mem_info(&self) -> PoolGeometry {
        self.shared.geometry
    }

    /// Region table of the installed configuration.
    pub fn region_table(&self) -> Option<RegionTable> {
        let state = self.shared.lock();
        state
            .config
            .as_ref()
            .map(|_| state.registry.regions().clone())
    }

    /// Copy up to `len` bytes of one plane of a done slot, starting
    /// `offset` bytes into the plane. Reads stop at the end of the plane.
    ///
    /// The lock is held for the copy so the slot cannot be acknowledged
    /// and re-armed underneath the read.
    pub fn read_region(
        &self,
        slot_id: usize,
        region: RegionId,
        plane: Plane,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, IpuError> {
        let state = self.shared.lock();
        if state.registry.state(slot_id)? != SlotState::Done {
            return Err(IpuError::SlotNotDone(slot_id));
        }
        let (plane_offset, size) = state.registry.regions().get(region).plane(plane);
        if size == 0 {
            return Err(IpuError::RegionNotWritten(region));
        }
        if offset > size {
            return Err(IpuError::PlaneOutOfRange {
                region,
                offset,
                size,
            });
        }
        let len = usize::try_from(size - offset).map_or(len, |rest| rest.min(len));
        let mut buf = vec![0; len];
        let addr = state.registry.slot_base(slot_id) + plane_offset + offset;
        self.shared.hw.read_memory(addr, &mut buf)?;
        Ok(buf)
    }

    /// Named register values reported by the hardware backend.
    pub fn dump_registers(&self) -> Vec<(String, u64)> {
        self.shared.hw.dump_registers()
    }

    pub fn slot_state(&self, slot_id: usize) -> Result<SlotState, IpuError> {
        self.shared.lock().registry.state(slot_id)
    }

    pub fn status(&self) -> DeviceStatus {
        let state = self.shared.lock();
        DeviceStatus {
            phase: state.phase,
            counts: state.registry.counts(),
            error_status: state.err_status,
            stats: state.stats,
        }
    }

    /// Stop the pipeline and wait for the worker to exit.
    pub async fn shutdown(&self) {
        self.stop();
        self.cancel.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "completion worker ended abnormally");
            }
        }
    }
}

impl Drop for IpuDevice {
    fn drop(&mut self) {
        self.shared.controller.stop();
        self.cancel.cancel();
    }
}

impl fmt::Debug for IpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpuDevice")
            .field("geometry", &self.shared.geometry)
            .field("status", &self.status())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
