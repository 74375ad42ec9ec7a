//! # ipu-core
//!
//! Slot manager for a camera image-pipeline unit (IPU).
//!
//! The IPU writes every captured frame, plus its cropped, scaled and pyramid
//! variants, into one fixed-size slot of a reserved memory pool. This crate
//! decides where each surface lands inside a slot, tracks which party owns
//! each slot and turns hardware interrupts into slot transitions.
//!
//! This crate contains:
//! - **Layout**: `LayoutPlanner` packs enabled surfaces into a `RegionTable`
//! - **Slots**: `SlotRegistry` with its free / busy / done ownership sets
//! - **Controller**: `PipelineController` arms and disarms the hardware
//! - **Processor**: `InterruptLine` and the completion worker
//! - **Frame ids**: big-endian and watermark decoding
//! - **Device**: `IpuDevice`, the control surface and consumer wait
//! - **Hardware**: the `IpuHardware` seam and the `SimHardware` backend
//! - **Protocol**: framed TCP control calls and `ControlClient`
//! - **Error**: `IpuError`, a `thiserror`-based error enum

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod frame_id;
pub mod hardware;
pub mod layout;
pub mod processor;
pub mod protocol;
pub mod sim;
pub mod slot;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::{
    Configuration, CropConfig, FrameIdConfig, FrameIdMode, Point, PyramidConfig, PyramidLayer,
    PyramidSource, Rect, ScaleConfig, Size,
};
pub use controller::{PipelineController, PipelinePhase};
pub use device::{DeviceStatus, IpuDevice, WakeReason};
pub use error::IpuError;
pub use hardware::{DdrPaths, IpuHardware};
pub use layout::{LayoutPlanner, Plane, RegionDescriptor, RegionId, RegionTable};
pub use processor::{EventMask, InterruptLine, PipelineStats};
pub use protocol::{ConnectionInfo, ControlClient, ControlRequest, ControlResponse};
pub use sim::{SimFrameSource, SimHardware};
pub use slot::{PoolGeometry, SlotCounts, SlotDescriptor, SlotRegistry, SlotState};
