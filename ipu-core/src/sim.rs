//! In-memory stand-in for the image-pipeline hardware.
//!
//! [`SimHardware`] records every register operation, owns a byte vector in
//! place of the reserved pool and can stamp frame ids into whatever surfaces
//! are currently armed. [`SimFrameSource`] drives it at a fixed frame rate
//! through an [`InterruptLine`], the way the capture hardware would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{Configuration, FrameIdMode};
use crate::error::IpuError;
use crate::frame_id;
use crate::hardware::{DdrPaths, IpuHardware};
use crate::layout::RegionId;
use crate::processor::{EventMask, InterruptLine};

/// One recorded call into the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwOp {
    Reset,
    ApplyConfig,
    DdrPaths { paths: DdrPaths, enable: bool },
    Irq(bool),
    LayerAddr { region: RegionId, y_addr: u64, c_addr: u64 },
}

#[derive(Debug, Default)]
struct Registers {
    ops: Vec<HwOp>,
    paths: DdrPaths,
    irq: bool,
    armed: HashMap<RegionId, (u64, u64)>,
    config: Option<Configuration>,
}

// ── SimHardware ──────────────────────────────────────────────────

/// Simulated pipeline with `size` bytes of pool memory at `base`.
#[derive(Debug)]
pub struct SimHardware {
    base: u64,
    memory: Mutex<Vec<u8>>,
    regs: Mutex<Registers>,
}

impl SimHardware {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            memory: Mutex::new(vec![0; size as usize]),
            regs: Mutex::new(Registers::default()),
        }
    }

    fn regs(&self) -> MutexGuard<'_, Registers> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory(&self) -> MutexGuard<'_, Vec<u8>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every operation since creation or the last [`clear_ops`](Self::clear_ops).
    pub fn ops(&self) -> Vec<HwOp> {
        self.regs().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.regs().ops.clear();
    }

    pub fn enabled_paths(&self) -> DdrPaths {
        self.regs().paths
    }

    pub fn irq_enabled(&self) -> bool {
        self.regs().irq
    }

    /// Luma and chroma addresses currently armed for `region`.
    pub fn armed_addr(&self, region: RegionId) -> Option<(u64, u64)> {
        self.regs().armed.get(&region).copied()
    }

    /// Whether the simulated pipeline would produce frames right now.
    pub fn is_streaming(&self) -> bool {
        let regs = self.regs();
        regs.irq && !regs.paths.is_empty()
    }

    /// Write raw bytes into pool memory.
    pub fn write_memory(&self, addr: u64, bytes: &[u8]) -> Result<(), IpuError> {
        let mut memory = self.memory();
        let range = self.range(addr, bytes.len(), memory.len())?;
        memory[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Stamp `id` into the armed crop, scale and pyramid layer 0 luma planes
    /// using the configured frame-id mode.
    pub fn stamp_frame_id(&self, id: u32) -> Result<(), IpuError> {
        let (mode, targets) = {
            let regs = self.regs();
            let mode = regs
                .config
                .as_ref()
                .map_or(FrameIdMode::Off, |cfg| cfg.frame_id.mode);
            let targets: Vec<u64> = [RegionId::Crop, RegionId::Scale, RegionId::Downscale(0)]
                .iter()
                .filter_map(|region| regs.armed.get(region).map(|&(y, _)| y))
                .collect();
            (mode, targets)
        };

        let stamp = frame_id::encode(mode, id);
        if stamp.is_empty() {
            return Ok(());
        }
        for addr in targets {
            self.write_memory(addr, &stamp)?;
        }
        trace!(id, ?mode, "frame id stamped");
        Ok(())
    }

    fn range(
        &self,
        addr: u64,
        len: usize,
        mapped: usize,
    ) -> Result<std::ops::Range<usize>, IpuError> {
        let start = addr
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok());
        match start.and_then(|s| Some(s..s.checked_add(len)?)) {
            Some(range) if range.end <= mapped => Ok(range),
            _ => Err(IpuError::MemoryOutOfRange { addr, len }),
        }
    }
}

impl IpuHardware for SimHardware {
    fn reset(&self) {
        let mut regs = self.regs();
        regs.ops.push(HwOp::Reset);
        regs.paths = DdrPaths::empty();
        regs.irq = false;
        regs.armed.clear();
    }

    fn apply_config(&self, cfg: &Configuration) {
        let mut regs = self.regs();
        regs.ops.push(HwOp::ApplyConfig);
        regs.config = Some(cfg.clone());
        regs.armed.clear();
    }

    fn set_ddr_paths(&self, paths: DdrPaths, enable: bool) {
        let mut regs = self.regs();
        regs.ops.push(HwOp::DdrPaths { paths, enable });
        regs.paths.set(paths, enable);
    }

    fn set_irq_enabled(&self, enabled: bool) {
        let mut regs = self.regs();
        regs.ops.push(HwOp::Irq(enabled));
        regs.irq = enabled;
    }

    fn set_layer_addr(&self, region: RegionId, y_addr: u64, c_addr: u64) {
        let mut regs = self.regs();
        regs.ops.push(HwOp::LayerAddr {
            region,
            y_addr,
            c_addr,
        });
        regs.armed.insert(region, (y_addr, c_addr));
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), IpuError> {
        let memory = self.memory();
        let range = self.range(addr, buf.len(), memory.len())?;
        buf.copy_from_slice(&memory[range]);
        Ok(())
    }

    fn dump_registers(&self) -> Vec<(String, u64)> {
        let regs = self.regs();
        let mut dump = vec![
            ("ddr_paths".to_string(), u64::from(regs.paths.bits())),
            ("irq_enable".to_string(), u64::from(regs.irq)),
        ];
        let mut armed: Vec<_> = regs.armed.iter().collect();
        armed.sort_by_key(|(region, _)| region.to_string());
        for (region, &(y_addr, c_addr)) in armed {
            dump.push((format!("{region}_y_addr"), y_addr));
            dump.push((format!("{region}_c_addr"), c_addr));
        }
        dump
    }
}

// ── SimFrameSource ───────────────────────────────────────────────

/// Produces frames into a [`SimHardware`] and raises the matching events.
///
/// Each frame: stamp the sequence number into the armed slot, raise
/// `FRAME_START`, wait half a frame, raise `PYM_FRAME_DONE`. When
/// `drop_every` is non-zero every n-th frame ends in `PYM_DS_FRAME_DROP`
/// instead.
#[derive(Debug, Clone)]
pub struct SimFrameSource {
    hw: Arc<SimHardware>,
    line: InterruptLine,
    period: Duration,
    drop_every: u64,
}

impl SimFrameSource {
    pub fn new(hw: Arc<SimHardware>, line: InterruptLine, fps: u32) -> Self {
        Self {
            hw,
            line,
            period: Duration::from_secs(1) / fps.max(1),
            drop_every: 0,
        }
    }

    pub fn with_drop_every(mut self, drop_every: u64) -> Self {
        self.drop_every = drop_every;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.run() => {}
            }
            debug!("frame source stopped");
        })
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sequence: u64 = 0;

        loop {
            ticker.tick().await;
            if !self.hw.is_streaming() {
                continue;
            }
            sequence += 1;

            if let Err(e) = self.hw.stamp_frame_id(sequence as u32 & 0xffff) {
                debug!(error = %e, "frame id stamp skipped");
            }
            self.line.raise(EventMask::FRAME_START);
            tokio::time::sleep(self.period / 2).await;

            if self.drop_every != 0 && sequence % self.drop_every == 0 {
                self.line.raise(EventMask::PYM_DS_FRAME_DROP);
            } else {
                self.line.raise(EventMask::PYM_FRAME_DONE);
            }
        }
    }
}
