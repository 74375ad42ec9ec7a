//! Pipeline lifecycle: arming and disarming the hardware write paths.
//!
//! ```text
//!  Uninitialized ──init──► Stopped ──start──► Running
//!                            ▲  ▲                │
//!                            │  └─────stop───────┘
//!                            └──init (implies stop)
//! ```
//!
//! `reconfigure` is a stop → replan → reinit → start composite driven by
//! [`IpuDevice`](crate::device::IpuDevice); the controller provides the
//! individual hardware steps.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::IpuError;
use crate::hardware::{DdrPaths, IpuHardware};
use crate::layout::RegionTable;
use crate::processor::IrqState;

// ── PipelinePhase ────────────────────────────────────────────────

/// Lifecycle phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PipelinePhase {
    /// No configuration has been installed yet.
    #[default]
    Uninitialized,
    /// Configured, hardware disarmed.
    Stopped,
    /// Hardware armed and raising events.
    Running,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
        }
    }
}

impl PipelinePhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// A configuration was installed.
    ///
    /// Valid from: `Uninitialized`, `Stopped`.
    pub fn configured(&mut self) -> Result<(), IpuError> {
        match self {
            Self::Uninitialized | Self::Stopped => {
                *self = Self::Stopped;
                Ok(())
            }
            Self::Running => Err(IpuError::InvalidTransition(
                "cannot configure: pipeline is running",
            )),
        }
    }

    /// The hardware was armed.
    ///
    /// Valid from: `Stopped`.
    pub fn begin_running(&mut self) -> Result<(), IpuError> {
        match self {
            Self::Stopped => {
                *self = Self::Running;
                Ok(())
            }
            Self::Uninitialized => Err(IpuError::NotInitialized),
            Self::Running => Err(IpuError::InvalidTransition(
                "cannot start: pipeline already running",
            )),
        }
    }

    /// The hardware was disarmed. Returns whether it had been running.
    pub fn halt(&mut self) -> bool {
        match self {
            Self::Running => {
                *self = Self::Stopped;
                true
            }
            _ => false,
        }
    }
}

// ── PipelineController ───────────────────────────────────────────

/// Drives the transfer paths, the interrupt line and the stop flag.
pub struct PipelineController {
    hw: Arc<dyn IpuHardware>,
    irq: Arc<IrqState>,
}

impl PipelineController {
    pub(crate) fn new(hw: Arc<dyn IpuHardware>, irq: Arc<IrqState>) -> Self {
        Self { hw, irq }
    }

    /// Module reset followed by a full register load for `cfg`.
    pub fn reset(&self, cfg: &Configuration) {
        self.hw.reset();
        self.hw.apply_config(cfg);
    }

    /// Register load for `cfg` without a module reset.
    pub fn apply(&self, cfg: &Configuration) {
        self.hw.apply_config(cfg);
    }

    /// Point every written surface at the slot starting at `base`.
    pub fn program_slot(&self, regions: &RegionTable, base: u64) {
        for (id, region) in regions.iter() {
            let y_addr = base + region.y_offset;
            let c_addr = if region.c_size > 0 {
                base + region.c_offset
            } else {
                0
            };
            self.hw.set_layer_addr(id, y_addr, c_addr);
        }
        debug!("slot programmed at {base:#x}");
    }

    /// Enable the configured transfer paths and the interrupt.
    pub fn start(&self, cfg: &Configuration) {
        let paths = DdrPaths::for_config(cfg);
        self.hw.set_ddr_paths(paths, true);
        self.hw.set_irq_enabled(true);
        self.irq.set_stopped(false);
        info!(?paths, "ipu start");
    }

    /// Disarm everything. Idempotent; returns whether anything changed.
    ///
    /// The stop flag is raised before the hardware is touched so the
    /// completion processor discards any event that races with the stop.
    pub fn stop(&self) -> bool {
        if self.irq.set_stopped(true) {
            debug!("ipu already stopped");
            return false;
        }
        self.hw.set_ddr_paths(DdrPaths::all(), false);
        self.hw.set_irq_enabled(false);
        self.irq.clear_pending();
        info!("ipu stop");
        true
    }

    /// Disable all transfer paths but leave the interrupt armed.
    pub fn disable_paths(&self) {
        self.hw.set_ddr_paths(DdrPaths::all(), false);
    }

    pub fn is_stopped(&self) -> bool {
        self.irq.is_stopped()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Size;
    use crate::layout::{LayoutPlanner, RegionId};
    use crate::sim::{HwOp, SimHardware};

    fn controller() -> (Arc<SimHardware>, PipelineController) {
        let hw = Arc::new(SimHardware::new(0, 0x40_0000));
        let irq = Arc::new(IrqState::new());
        let ctrl = PipelineController::new(hw.clone(), irq);
        (hw, ctrl)
    }

    #[test]
    fn phase_lifecycle() {
        let mut phase = PipelinePhase::default();
        assert!(matches!(phase.begin_running(), Err(IpuError::NotInitialized)));
        phase.configured().unwrap();
        phase.begin_running().unwrap();
        assert!(phase.is_running());
        assert!(phase.configured().is_err());
        assert!(phase.begin_running().is_err());
        assert!(phase.halt());
        assert!(!phase.halt());
        assert_eq!(phase, PipelinePhase::Stopped);
    }

    #[test]
    fn start_enables_only_configured_paths() {
        let (hw, ctrl) = controller();
        let mut cfg = Configuration::default();
        cfg.scale.to_ddr = true;
        cfg.scale.target = Size::new(64, 64);

        assert!(ctrl.is_stopped());
        ctrl.start(&cfg);
        assert!(!ctrl.is_stopped());
        assert_eq!(hw.enabled_paths(), DdrPaths::SCALE);
        assert!(hw.irq_enabled());
    }

    #[test]
    fn stop_is_idempotent() {
        let (hw, ctrl) = controller();
        ctrl.start(&Configuration::hd_default());
        hw.clear_ops();

        assert!(ctrl.stop());
        assert!(!ctrl.stop());
        assert_eq!(
            hw.ops(),
            vec![
                HwOp::DdrPaths {
                    paths: DdrPaths::all(),
                    enable: false
                },
                HwOp::Irq(false),
            ]
        );
        assert!(hw.enabled_paths().is_empty());
    }

    #[test]
    fn program_slot_skips_bypassed_chroma() {
        let (hw, ctrl) = controller();
        let mut cfg = Configuration::hd_default();
        cfg.scale.uv_bypass = true;
        let regions = LayoutPlanner::new(0x40_0000).plan(&cfg).unwrap();

        ctrl.program_slot(&regions, 0x1000_0000);
        let (y, c) = hw.armed_addr(RegionId::Crop).unwrap();
        assert_eq!(y, 0x1000_0000);
        assert_eq!(c, 0x1000_0000 + regions.crop.c_offset);
        let (y, c) = hw.armed_addr(RegionId::Scale).unwrap();
        assert_eq!(y, 0x1000_0000 + regions.scale.y_offset);
        assert_eq!(c, 0);
    }
}
