//! Pipeline configuration: which output stages run and what they write.
//!
//! A [`Configuration`] is supplied by the supervising process on `init` and
//! `reconfigure`. It is plain data; the layout planner turns it into byte
//! offsets and the hardware backend turns it into register values.

use serde::{Deserialize, Serialize};

use crate::error::IpuError;

/// Downsample layers exposed by the pyramid (6 octaves of 4 layers).
pub const DS_LAYER_MAX: usize = 24;

/// Upsample layers exposed by the pyramid.
pub const US_LAYER_MAX: usize = 6;

/// Downsample layers per octave; index `4 * n` is always a base layer.
pub const DS_LAYERS_PER_OCTAVE: usize = 4;

// ── Geometry ─────────────────────────────────────────────────────

/// A point in the input frame, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// A width/height pair, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A region of interest: top-left corner plus extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

// ── Stages ───────────────────────────────────────────────────────

/// Crop stage: cuts `start..end` out of the input frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Write the cropped image to the slot.
    pub to_ddr: bool,
    /// Top-left corner, inclusive.
    pub start: Point,
    /// Bottom-right corner, exclusive.
    pub end: Point,
    /// Write only the luma plane.
    pub uv_bypass: bool,
}

impl CropConfig {
    /// Output dimensions of the crop stage.
    pub fn output(&self) -> Size {
        Size::new(
            self.end.x.saturating_sub(self.start.x),
            self.end.y.saturating_sub(self.start.y),
        )
    }
}

/// Scale stage: resamples `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Write the scaled image to the slot.
    pub to_ddr: bool,
    pub source: Size,
    pub target: Size,
    /// Horizontal step in 1/4096 units.
    pub step_x: u16,
    /// Vertical step in 1/4096 units.
    pub step_y: u16,
    pub bypass_x: bool,
    pub bypass_y: bool,
    pub pre_scale_x: u8,
    pub pre_scale_y: u8,
    /// Write only the luma plane.
    pub uv_bypass: bool,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            to_ddr: false,
            source: Size::default(),
            target: Size::default(),
            step_x: 4095,
            step_y: 4095,
            bypass_x: true,
            bypass_y: true,
            pre_scale_x: 0,
            pre_scale_y: 0,
            uv_bypass: false,
        }
    }
}

/// Which upstream stage feeds the pyramid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PyramidSource {
    #[default]
    Crop,
    Scale,
}

/// One pyramid layer (downsample or upsample).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidLayer {
    pub enable: bool,
    /// Scale factor; 0 on a non-base downsample layer means pass-through.
    pub factor: u8,
    pub roi: Rect,
    /// Width of the layer's source image.
    pub src_width: u32,
    /// Write only the luma plane.
    pub uv_bypass: bool,
}

impl PyramidLayer {
    pub fn new(factor: u8, roi: Rect) -> Self {
        Self {
            enable: true,
            factor,
            roi,
            ..Default::default()
        }
    }

    pub fn with_uv_bypass(mut self) -> Self {
        self.uv_bypass = true;
        self
    }
}

/// Multi-resolution pyramid stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub enable: bool,
    pub source: PyramidSource,
    /// Downsample layers by index, at most [`DS_LAYER_MAX`].
    pub ds_layers: Vec<PyramidLayer>,
    /// Upsample layers by index, at most [`US_LAYER_MAX`].
    pub us_layers: Vec<PyramidLayer>,
}

impl PyramidConfig {
    /// Whether downsample layer `index` produces a memory write.
    ///
    /// Layer 0 of every octave is a base layer and always writes when
    /// enabled; interpolated layers with factor 0 pass through.
    pub fn ds_writes(&self, index: usize) -> bool {
        match self.ds_layers.get(index) {
            Some(layer) if layer.enable => {
                index % DS_LAYERS_PER_OCTAVE == 0 || layer.factor != 0
            }
            _ => false,
        }
    }

    /// Whether upsample layer `index` produces a memory write.
    pub fn us_writes(&self, index: usize) -> bool {
        self.us_layers.get(index).is_some_and(|l| l.enable)
    }
}

// ── Frame id ─────────────────────────────────────────────────────

/// How the hardware stamps the frame identifier into pixel data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameIdMode {
    /// No frame id is embedded.
    #[default]
    Off,
    /// Two big-endian bytes at the start of the plane.
    Bytes,
    /// Eight 16-bit samples, saturated for 1 bits.
    Watermark,
}

/// Frame id stamping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameIdConfig {
    pub mode: FrameIdMode,
    /// Stamp into the crop output.
    pub crop: bool,
    /// Stamp into the scale output (or pyramid layer 0 without scale).
    pub scale: bool,
}

// ── Configuration ────────────────────────────────────────────────

/// Complete description of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Input video dimensions.
    pub video_in: Size,
    pub crop: CropConfig,
    pub scale: ScaleConfig,
    pub pyramid: PyramidConfig,
    pub frame_id: FrameIdConfig,
}

impl Configuration {
    /// Reject configurations the hardware cannot represent.
    pub fn validate(&self) -> Result<(), IpuError> {
        if self.crop.to_ddr {
            let out = self.crop.output();
            if self.crop.end.x < self.crop.start.x || self.crop.end.y < self.crop.start.y {
                return Err(IpuError::InvalidConfig(
                    "crop end lies before crop start".into(),
                ));
            }
            if out.width == 0 || out.height == 0 {
                return Err(IpuError::InvalidConfig("crop output is empty".into()));
            }
        }
        if self.scale.to_ddr && (self.scale.target.width == 0 || self.scale.target.height == 0) {
            return Err(IpuError::InvalidConfig("scale target is empty".into()));
        }
        if self.pyramid.ds_layers.len() > DS_LAYER_MAX {
            return Err(IpuError::InvalidConfig(format!(
                "{} downsample layers (max {DS_LAYER_MAX})",
                self.pyramid.ds_layers.len()
            )));
        }
        if self.pyramid.us_layers.len() > US_LAYER_MAX {
            return Err(IpuError::InvalidConfig(format!(
                "{} upsample layers (max {US_LAYER_MAX})",
                self.pyramid.us_layers.len()
            )));
        }
        Ok(())
    }

    /// Whether any stage writes to memory at all.
    pub fn writes_ddr(&self) -> bool {
        self.crop.to_ddr || self.scale.to_ddr || self.pyramid.enable
    }

    /// 720p crop + scale to DDR, pyramid off. Used as the daemon default.
    pub fn hd_default() -> Self {
        Self {
            video_in: Size::new(1280, 720),
            crop: CropConfig {
                to_ddr: true,
                start: Point { x: 0, y: 0 },
                end: Point { x: 1280, y: 720 },
                uv_bypass: false,
            },
            scale: ScaleConfig {
                to_ddr: true,
                source: Size::new(1280, 720),
                target: Size::new(640, 360),
                step_x: 8190,
                step_y: 8190,
                bypass_x: false,
                bypass_y: false,
                ..Default::default()
            },
            pyramid: PyramidConfig::default(),
            frame_id: FrameIdConfig::default(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
