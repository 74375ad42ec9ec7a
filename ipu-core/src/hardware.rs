//! The seam between the slot manager and the image-pipeline hardware.
//!
//! Register programming, memory mapping and interrupt masking are provided
//! by a platform backend implementing [`IpuHardware`]. The slot manager only
//! decides *what* to program and *when*.

use bitflags::bitflags;

use crate::config::Configuration;
use crate::error::IpuError;
use crate::layout::RegionId;

bitflags! {
    /// Hardware-to-memory transfer paths.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DdrPaths: u32 {
        const CROP    = 1 << 0;
        const SCALE   = 1 << 1;
        const PYRAMID = 1 << 2;
    }
}

impl DdrPaths {
    /// Paths a configuration writes through.
    pub fn for_config(cfg: &Configuration) -> Self {
        let mut paths = Self::empty();
        paths.set(Self::CROP, cfg.crop.to_ddr);
        paths.set(Self::SCALE, cfg.scale.to_ddr);
        paths.set(Self::PYRAMID, cfg.pyramid.enable);
        paths
    }
}

impl Default for DdrPaths {
    fn default() -> Self {
        Self::empty()
    }
}

/// Platform primitives the slot manager drives.
///
/// Implementations must not block: every method is called with the slot
/// registry lock held.
pub trait IpuHardware: Send + Sync {
    /// Pulse the module reset line.
    fn reset(&self);

    /// Program the stage registers (input size, crop window, scaler steps,
    /// pyramid layers, frame-id stamping) for `cfg`.
    fn apply_config(&self, cfg: &Configuration);

    /// Enable or disable the given transfer paths.
    fn set_ddr_paths(&self, paths: DdrPaths, enable: bool);

    /// Unmask or mask the pipeline interrupt line.
    fn set_irq_enabled(&self, enabled: bool);

    /// Program the next-write addresses of one output surface.
    ///
    /// `c_addr` is zero when the chroma plane is bypassed.
    fn set_layer_addr(&self, region: RegionId, y_addr: u64, c_addr: u64);

    /// Copy bytes out of the mapped pool at physical address `addr`.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), IpuError>;

    /// Named register values for diagnostics. Empty when the backend
    /// cannot read its registers back.
    fn dump_registers(&self) -> Vec<(String, u64)> {
        Vec::new()
    }
}
