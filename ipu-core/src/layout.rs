//! DDR layout planning for one slot.
//!
//! Every enabled output surface (crop, scale, each pyramid layer) gets a
//! luma plane and, unless bypassed, a half-size 4:2:0 chroma plane. Regions
//! are packed back to back from the start of the slot, each re-aligned to
//! [`SLOT_ALIGN`] bytes, in a fixed stage order:
//!
//! ```text
//!  0 ─► crop Y ─► crop UV ─► scale Y ─► scale UV ─► ds0 Y ─► ... ─► us5 UV ─► slot_size
//! ```
//!
//! Planning is all-or-nothing: a configuration whose regions overflow the
//! slot budget produces an error and no table.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Configuration, Size};
use crate::error::IpuError;

/// Alignment of every region offset, stride and plane height.
pub const SLOT_ALIGN: u64 = 16;

/// Round `value` up to the next multiple of [`SLOT_ALIGN`].
pub const fn align16(value: u64) -> u64 {
    (value + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

// ── RegionId ─────────────────────────────────────────────────────

/// Names one output surface inside a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionId {
    Crop,
    Scale,
    /// Pyramid downsample layer.
    Downscale(u8),
    /// Pyramid upsample layer.
    Upscale(u8),
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crop => write!(f, "crop"),
            Self::Scale => write!(f, "scale"),
            Self::Downscale(i) => write!(f, "ds{i}"),
            Self::Upscale(i) => write!(f, "us{i}"),
        }
    }
}

/// One plane of an output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plane {
    Luma,
    /// Interleaved UV.
    Chroma,
}

// ── RegionDescriptor ─────────────────────────────────────────────

/// Placement of one output surface, relative to the slot base.
///
/// A default (all-zero) descriptor marks a surface that is not written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub y_offset: u64,
    /// Zero when the chroma plane is bypassed.
    pub c_offset: u64,
    /// Bytes reserved for the luma plane.
    pub y_size: u64,
    /// Bytes reserved for the chroma plane (zero on bypass).
    pub c_size: u64,
    pub y_width: u32,
    pub y_height: u32,
    pub y_stride: u32,
    /// UV sample pairs per chroma row: half the luma width.
    pub c_width: u32,
    /// Chroma rows: half the luma height.
    pub c_height: u32,
    /// Bytes per interleaved UV row, equal to the luma stride.
    pub c_stride: u32,
}

impl RegionDescriptor {
    /// Whether this surface produces no memory write.
    pub fn is_empty(&self) -> bool {
        self.y_size == 0
    }

    /// Whether only the luma plane is written.
    pub fn is_bypass(&self) -> bool {
        !self.is_empty() && self.c_size == 0
    }

    /// Byte ranges `[offset, offset + size)` occupied by this surface.
    pub fn spans(&self) -> impl Iterator<Item = (u64, u64)> {
        [(self.y_offset, self.y_size), (self.c_offset, self.c_size)]
            .into_iter()
            .filter(|&(_, size)| size > 0)
            .map(|(offset, size)| (offset, offset + size))
    }

    /// Slot-relative offset and reserved size of one plane.
    ///
    /// A bypassed chroma plane reads as `(0, 0)`.
    pub fn plane(&self, plane: Plane) -> (u64, u64) {
        match plane {
            Plane::Luma => (self.y_offset, self.y_size),
            Plane::Chroma => (self.c_offset, self.c_size),
        }
    }

    /// Total bytes reserved by this surface.
    pub fn reserved(&self) -> u64 {
        self.y_size + self.c_size
    }
}

// ── RegionTable ──────────────────────────────────────────────────

/// Offsets of every output surface, shared by all slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionTable {
    pub crop: RegionDescriptor,
    pub scale: RegionDescriptor,
    /// Indexed by downsample layer; pass-through layers are empty.
    pub ds: Vec<RegionDescriptor>,
    /// Indexed by upsample layer; disabled layers are empty.
    pub us: Vec<RegionDescriptor>,
    /// Final aligned cursor: bytes of the slot in use.
    pub used: u64,
}

impl RegionTable {
    /// Look up one surface; missing layers read as empty.
    pub fn get(&self, id: RegionId) -> RegionDescriptor {
        match id {
            RegionId::Crop => self.crop,
            RegionId::Scale => self.scale,
            RegionId::Downscale(i) => self.ds.get(i as usize).copied().unwrap_or_default(),
            RegionId::Upscale(i) => self.us.get(i as usize).copied().unwrap_or_default(),
        }
    }

    /// All surfaces that are written, in packing order.
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &RegionDescriptor)> {
        let fixed = [(RegionId::Crop, &self.crop), (RegionId::Scale, &self.scale)];
        let ds = self
            .ds
            .iter()
            .enumerate()
            .map(|(i, r)| (RegionId::Downscale(i as u8), r));
        let us = self
            .us
            .iter()
            .enumerate()
            .map(|(i, r)| (RegionId::Upscale(i as u8), r));
        fixed
            .into_iter()
            .chain(ds)
            .chain(us)
            .filter(|(_, r)| !r.is_empty())
    }
}

// ── LayoutPlanner ────────────────────────────────────────────────

/// Packs a [`Configuration`] into a fixed per-slot byte budget.
#[derive(Debug, Clone, Copy)]
pub struct LayoutPlanner {
    slot_size: u64,
}

impl LayoutPlanner {
    pub fn new(slot_size: u64) -> Self {
        Self { slot_size }
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Compute the region table for `cfg`.
    pub fn plan(&self, cfg: &Configuration) -> Result<RegionTable, IpuError> {
        cfg.validate()?;

        let mut cursor = Cursor {
            pos: align16(0),
            limit: self.slot_size,
        };
        let mut table = RegionTable::default();

        if cfg.crop.to_ddr {
            table.crop = cursor.reserve(RegionId::Crop, cfg.crop.output(), cfg.crop.uv_bypass)?;
        }

        if cfg.scale.to_ddr {
            table.scale = cursor.reserve(RegionId::Scale, cfg.scale.target, cfg.scale.uv_bypass)?;
        }

        if cfg.pyramid.enable {
            let pyramid = &cfg.pyramid;
            table.ds = vec![RegionDescriptor::default(); pyramid.ds_layers.len()];
            for (i, layer) in pyramid.ds_layers.iter().enumerate() {
                if !pyramid.ds_writes(i) {
                    continue;
                }
                let id = RegionId::Downscale(i as u8);
                table.ds[i] = cursor.reserve(id, layer.roi.size(), layer.uv_bypass)?;
            }

            table.us = vec![RegionDescriptor::default(); pyramid.us_layers.len()];
            for (i, layer) in pyramid.us_layers.iter().enumerate() {
                if !pyramid.us_writes(i) {
                    continue;
                }
                let id = RegionId::Upscale(i as u8);
                table.us[i] = cursor.reserve(id, layer.roi.size(), layer.uv_bypass)?;
            }
        }

        table.used = cursor.pos;
        debug!(
            used = table.used,
            budget = self.slot_size,
            regions = table.iter().count(),
            "slot layout planned"
        );
        Ok(table)
    }
}

/// Running byte cursor inside one slot.
struct Cursor {
    pos: u64,
    limit: u64,
}

impl Cursor {
    fn reserve(&mut self, id: RegionId, size: Size, uv_bypass: bool) -> Result<RegionDescriptor, IpuError> {
        let overflow = |cursor: u64| IpuError::LayoutOverflow {
            stage: id,
            cursor,
            limit: self.limit,
        };

        let stride = align16(u64::from(size.width));
        let y_stride = u32::try_from(stride).map_err(|_| overflow(u64::MAX))?;
        let luma = stride
            .checked_mul(align16(u64::from(size.height)))
            .ok_or_else(|| overflow(u64::MAX))?;
        let chroma = if uv_bypass { 0 } else { luma / 2 };
        let end = self
            .pos
            .checked_add(luma)
            .and_then(|p| p.checked_add(chroma))
            .and_then(checked_align16)
            .ok_or_else(|| overflow(u64::MAX))?;
        if end >= self.limit {
            return Err(overflow(end));
        }

        let mut region = RegionDescriptor {
            y_offset: self.pos,
            y_size: luma,
            y_width: size.width,
            y_height: size.height,
            y_stride,
            ..Default::default()
        };
        if !uv_bypass {
            region.c_offset = self.pos + luma;
            region.c_size = chroma;
            region.c_width = size.width >> 1;
            region.c_height = size.height / 2;
            region.c_stride = y_stride;
        }
        self.pos = end;
        Ok(region)
    }
}

/// [`align16`] that reports overflow instead of wrapping.
fn checked_align16(value: u64) -> Option<u64> {
    value
        .checked_add(SLOT_ALIGN - 1)
        .map(|v| v & !(SLOT_ALIGN - 1))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Point, PyramidLayer, Rect};

    const MIB: u64 = 1024 * 1024;

    fn crop_and_scale() -> Configuration {
        let mut cfg = Configuration::default();
        cfg.crop.to_ddr = true;
        cfg.crop.start = Point { x: 0, y: 0 };
        cfg.crop.end = Point { x: 256, y: 256 };
        cfg.scale.to_ddr = true;
        cfg.scale.target = Size::new(128, 128);
        cfg.scale.uv_bypass = true;
        cfg
    }

    fn assert_disjoint(table: &RegionTable) {
        let mut spans: Vec<(u64, u64)> = table.iter().flat_map(|(_, r)| r.spans()).collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?} / {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn crop_and_scale_in_one_mib() {
        let table = LayoutPlanner::new(MIB).plan(&crop_and_scale()).unwrap();

        assert_eq!(table.crop.y_offset, 0);
        assert_eq!(table.crop.y_size, 65536);
        assert_eq!(table.crop.c_offset, 65536);
        assert_eq!(table.crop.c_size, 32768);

        assert_eq!(table.scale.y_offset, 98304);
        assert_eq!(table.scale.y_size, 16384);
        assert_eq!(table.scale.c_offset, 0);
        assert!(table.scale.is_bypass());

        assert_eq!(table.used, 114688);
        assert_disjoint(&table);
    }

    #[test]
    fn unaligned_dimensions_are_padded() {
        let mut cfg = Configuration::default();
        cfg.scale.to_ddr = true;
        cfg.scale.target = Size::new(100, 30);
        let table = LayoutPlanner::new(MIB).plan(&cfg).unwrap();
        assert_eq!(table.scale.y_stride, 112);
        assert_eq!(table.scale.y_size, 112 * 32);
        assert_eq!(table.scale.c_offset, 112 * 32);
        assert_eq!(table.used % SLOT_ALIGN, 0);
    }

    #[test]
    fn pyramid_layers_pack_in_order() {
        let mut cfg = Configuration::default();
        cfg.pyramid.enable = true;
        cfg.pyramid.ds_layers = vec![
            PyramidLayer::new(0, Rect::new(0, 0, 640, 360)),
            PyramidLayer::new(18, Rect::new(600, 250, 326, 30)),
            PyramidLayer::new(0, Rect::new(300, 194, 330, 54)),
            PyramidLayer::new(12, Rect::new(116, 60, 132, 92)).with_uv_bypass(),
        ];
        cfg.pyramid.us_layers = vec![
            PyramidLayer::new(0, Rect::new(782, 0, 48, 356)),
            PyramidLayer::default(),
            PyramidLayer::new(0, Rect::new(200, 186, 516, 160)),
        ];

        let table = LayoutPlanner::new(4 * MIB).plan(&cfg).unwrap();

        assert!(!table.ds[0].is_empty());
        assert!(!table.ds[1].is_empty());
        assert!(table.ds[2].is_empty(), "factor 0 on layer 2 passes through");
        assert_eq!(table.ds[2].y_offset, 0);
        assert!(table.ds[3].is_bypass());
        assert!(table.us[1].is_empty());
        assert!(table.ds[1].y_offset > table.ds[0].y_offset);
        assert!(table.us[0].y_offset > table.ds[3].y_offset);
        assert!(table.us[2].y_offset > table.us[0].y_offset);
        assert_disjoint(&table);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut cfg = crop_and_scale();
        cfg.crop.end = Point { x: 1920, y: 1080 };
        let err = LayoutPlanner::new(MIB).plan(&cfg).unwrap_err();
        assert!(matches!(
            err,
            IpuError::LayoutOverflow {
                stage: RegionId::Crop,
                ..
            }
        ));
    }

    #[test]
    fn huge_dimensions_overflow_instead_of_wrapping() {
        let mut cfg = Configuration::default();
        cfg.crop.to_ddr = true;
        cfg.crop.end = Point {
            x: u32::MAX,
            y: u32::MAX,
        };
        let err = LayoutPlanner::new(MIB).plan(&cfg).unwrap_err();
        assert!(matches!(
            err,
            IpuError::LayoutOverflow {
                stage: RegionId::Crop,
                ..
            }
        ));

        // Fits in u32 after alignment but the product exceeds any slot.
        cfg.crop.end = Point {
            x: u32::MAX - 15,
            y: u32::MAX - 15,
        };
        assert!(LayoutPlanner::new(u64::MAX).plan(&cfg).is_err());
    }

    #[test]
    fn cursor_near_u64_max_is_overflow() {
        let mut cursor = Cursor {
            pos: u64::MAX - 32,
            limit: u64::MAX,
        };
        assert!(cursor.reserve(RegionId::Scale, Size::new(64, 64), true).is_err());
        assert_eq!(cursor.pos, u64::MAX - 32);
    }

    #[test]
    fn chroma_rows_are_interleaved_pairs() {
        let table = LayoutPlanner::new(MIB).plan(&crop_and_scale()).unwrap();
        assert_eq!(table.crop.c_width, 128);
        assert_eq!(table.crop.c_height, 128);
        assert_eq!(table.crop.c_stride, table.crop.y_stride);
        assert_eq!(
            u64::from(table.crop.c_stride) * u64::from(table.crop.c_height),
            table.crop.c_size
        );
    }

    #[test]
    fn exact_fit_counts_as_overflow() {
        let mut cfg = Configuration::default();
        cfg.scale.to_ddr = true;
        cfg.scale.target = Size::new(64, 64);
        cfg.scale.uv_bypass = true;
        // 64 * 64 = 4096: a cursor landing on the budget is rejected.
        assert!(LayoutPlanner::new(4096).plan(&cfg).is_err());
        assert!(LayoutPlanner::new(4097).plan(&cfg).is_ok());
    }

    #[test]
    fn fitting_configs_never_overlap() {
        for w in [16u32, 33, 100, 250, 640] {
            for h in [16u32, 47, 90, 360] {
                let mut cfg = crop_and_scale();
                cfg.crop.end = Point { x: w, y: h };
                cfg.scale.target = Size::new(h, w);
                cfg.pyramid.enable = true;
                cfg.pyramid.ds_layers = vec![
                    PyramidLayer::new(0, Rect::new(0, 0, w / 2, h / 2)),
                    PyramidLayer::new(20, Rect::new(0, 0, w / 3 + 1, h / 3 + 1)),
                ];
                let table = LayoutPlanner::new(8 * MIB).plan(&cfg).unwrap();
                assert_disjoint(&table);
                assert!(table.used < 8 * MIB);
            }
        }
    }

    #[test]
    fn region_ids_display() {
        assert_eq!(RegionId::Downscale(4).to_string(), "ds4");
        assert_eq!(RegionId::Upscale(1).to_string(), "us1");
    }
}
