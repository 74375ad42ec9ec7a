//! Slot ownership tracking.
//!
//! The reserved memory pool is cut into `slot_count` equally sized slots.
//! Each slot is owned by exactly one party at a time:
//!
//! ```text
//!            acquire_for_pipeline        mark_complete
//!   Free ──────────────────────► Busy ──────────────────► Done
//!    ▲                            │                        │
//!    │        mark_error          │                        │
//!    ├────────────────────────────┘                        │
//!    │                  consume                            │
//!    └─────────────────────────────────────────────────────┘
//! ```
//!
//! `Busy` slots belong to the hardware, `Done` slots to the consumer. Slots
//! live in an arena and the three sets are ordered queues of ids, so the
//! oldest busy and oldest done slot are always at the front.
//!
//! The registry is plain data. Callers serialise access with one lock and
//! never block while holding it.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IpuError;
use crate::layout::RegionTable;

// ── SlotState ────────────────────────────────────────────────────

/// Which party currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    /// Available for the hardware to claim.
    Free,
    /// The hardware is writing into it.
    Busy,
    /// A complete frame waiting for the consumer.
    Done,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Busy => write!(f, "busy"),
            Self::Done => write!(f, "done"),
        }
    }
}

// ── SlotDescriptor ───────────────────────────────────────────────

/// What the consumer learns about a completed slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub slot_id: usize,
    /// Physical address of the slot start.
    pub base: u64,
    /// Frame id decoded from the crop output.
    pub crop_frame_id: u32,
    /// Frame id decoded from the scale output (or pyramid layer 0).
    pub scale_frame_id: u32,
    /// How many times this slot has been handed to the hardware.
    pub use_count: u64,
}

// ── PoolGeometry ─────────────────────────────────────────────────

/// Physical layout of the reserved memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGeometry {
    /// Physical start of the pool.
    pub base: u64,
    /// Bytes reserved for the pool.
    pub size: u64,
    /// Bytes per slot.
    pub slot_size: u64,
    pub slot_count: usize,
}

impl PoolGeometry {
    /// Validate a pool description.
    ///
    /// `slot_count` of zero means "as many slots as fit".
    pub fn new(base: u64, size: u64, slot_size: u64, slot_count: usize) -> Result<Self, IpuError> {
        if slot_size == 0 || slot_size % crate::layout::SLOT_ALIGN != 0 {
            return Err(IpuError::InvalidPool("slot size must be a non-zero multiple of 16"));
        }
        if base % crate::layout::SLOT_ALIGN != 0 {
            return Err(IpuError::InvalidPool("pool base must be 16-byte aligned"));
        }
        if base.checked_add(size).is_none() {
            return Err(IpuError::InvalidPool("pool extends past the end of the address space"));
        }
        let fit = (size / slot_size) as usize;
        let slot_count = if slot_count == 0 { fit } else { slot_count };
        if slot_count == 0 || slot_count > fit {
            return Err(IpuError::InvalidPool("pool too small for the requested slots"));
        }
        Ok(Self {
            base,
            size,
            slot_size,
            slot_count,
        })
    }

    /// Physical address of slot `id`.
    pub fn slot_base(&self, id: usize) -> u64 {
        self.base + id as u64 * self.slot_size
    }
}

// ── SlotRegistry ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    use_count: u64,
    descriptor: Option<SlotDescriptor>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            use_count: 0,
            descriptor: None,
        }
    }
}

/// Sizes of the three ownership sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub free: usize,
    pub busy: usize,
    pub done: usize,
}

/// The slot arena plus its free / busy / done sets.
#[derive(Debug)]
pub struct SlotRegistry {
    base: u64,
    slot_size: u64,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    busy: VecDeque<usize>,
    done: VecDeque<usize>,
    regions: RegionTable,
}

impl SlotRegistry {
    /// An empty registry; call [`initialize`](Self::initialize) before use.
    pub fn new(slot_size: u64) -> Self {
        Self {
            base: 0,
            slot_size,
            slots: Vec::new(),
            free: VecDeque::new(),
            busy: VecDeque::new(),
            done: VecDeque::new(),
            regions: RegionTable::default(),
        }
    }

    /// Rebuild the pool: every slot free, every descriptor cleared.
    ///
    /// Only call while the pipeline is stopped.
    pub fn initialize(&mut self, base: u64, regions: RegionTable, slot_count: usize) {
        self.base = base;
        self.regions = regions;
        self.slots = vec![Slot::new(); slot_count];
        self.free = (0..slot_count).collect();
        self.busy.clear();
        self.done.clear();
    }

    /// Claim the oldest free slot for the hardware.
    ///
    /// `None` is ordinary backpressure, not an error.
    pub fn acquire_for_pipeline(&mut self) -> Option<usize> {
        let id = self.free.pop_front()?;
        let slot = &mut self.slots[id];
        slot.state = SlotState::Busy;
        slot.use_count += 1;
        slot.descriptor = None;
        self.busy.push_back(id);
        Some(id)
    }

    /// Hand a finished slot to the consumer.
    ///
    /// Returns its fresh descriptor so the caller can fill in frame ids.
    pub fn mark_complete(&mut self, id: usize) -> Result<&mut SlotDescriptor, IpuError> {
        self.expect_state(id, SlotState::Busy)?;
        Self::remove(&mut self.busy, id);
        self.done.push_back(id);

        let base = self.slot_base(id);
        let slot = &mut self.slots[id];
        slot.state = SlotState::Done;
        Ok(slot.descriptor.insert(SlotDescriptor {
            slot_id: id,
            base,
            crop_frame_id: 0,
            scale_frame_id: 0,
            use_count: slot.use_count,
        }))
    }

    /// Abort a busy slot; its contents are never surfaced.
    pub fn mark_error(&mut self, id: usize) -> Result<(), IpuError> {
        self.expect_state(id, SlotState::Busy)?;
        Self::remove(&mut self.busy, id);
        self.release(id);
        Ok(())
    }

    /// The consumer is finished with a done slot.
    pub fn consume(&mut self, id: usize) -> Result<(), IpuError> {
        match self.state(id)? {
            SlotState::Done => {}
            _ => return Err(IpuError::SlotNotDone(id)),
        }
        Self::remove(&mut self.done, id);
        self.release(id);
        Ok(())
    }

    /// Oldest done slot, without taking it.
    pub fn peek_done(&self) -> Option<&SlotDescriptor> {
        let id = *self.done.front()?;
        self.slots[id].descriptor.as_ref()
    }

    /// Oldest busy slot: the one the hardware finishes next.
    pub fn oldest_busy(&self) -> Option<usize> {
        self.busy.front().copied()
    }

    /// Return every busy and done slot to free.
    pub fn drain(&mut self) -> usize {
        let ids: Vec<usize> = self.busy.drain(..).chain(self.done.drain(..)).collect();
        let drained = ids.len();
        for id in ids {
            self.release(id);
        }
        drained
    }

    pub fn state(&self, id: usize) -> Result<SlotState, IpuError> {
        self.slots
            .get(id)
            .map(|s| s.state)
            .ok_or(IpuError::InvalidSlot(id))
    }

    pub fn descriptor(&self, id: usize) -> Option<&SlotDescriptor> {
        self.slots.get(id)?.descriptor.as_ref()
    }

    pub fn counts(&self) -> SlotCounts {
        SlotCounts {
            free: self.free.len(),
            busy: self.busy.len(),
            done: self.done.len(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_base(&self, id: usize) -> u64 {
        self.base + id as u64 * self.slot_size
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    // ── Internal ─────────────────────────────────────────────────

    fn expect_state(&self, id: usize, expected: SlotState) -> Result<(), IpuError> {
        let state = self.state(id)?;
        if state == expected {
            Ok(())
        } else {
            Err(IpuError::SlotNotBusy(id))
        }
    }

    fn release(&mut self, id: usize) {
        let slot = &mut self.slots[id];
        slot.state = SlotState::Free;
        slot.descriptor = None;
        self.free.push_back(id);
    }

    fn remove(set: &mut VecDeque<usize>, id: usize) {
        if let Some(pos) = set.iter().position(|&s| s == id) {
            set.remove(pos);
        }
    }

    /// Every slot sits in exactly the set its tag names.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (id, slot) in self.slots.iter().enumerate() {
            let memberships = [
                (SlotState::Free, self.free.contains(&id)),
                (SlotState::Busy, self.busy.contains(&id)),
                (SlotState::Done, self.done.contains(&id)),
            ];
            let owners: Vec<SlotState> = memberships
                .iter()
                .filter(|(_, member)| *member)
                .map(|(state, _)| *state)
                .collect();
            assert_eq!(owners, vec![slot.state], "slot {id} owned by {owners:?}");
            if slot.state != SlotState::Done {
                assert!(slot.descriptor.is_none(), "slot {id} leaks a descriptor");
            }
        }
        let total = self.free.len() + self.busy.len() + self.done.len();
        assert_eq!(total, self.slots.len());
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SLOT: u64 = 0x10_0000;

    fn registry(count: usize) -> SlotRegistry {
        let mut reg = SlotRegistry::new(SLOT);
        reg.initialize(0x8000_0000, RegionTable::default(), count);
        reg
    }

    #[test]
    fn four_slot_walkthrough() {
        let mut reg = registry(4);

        for expected in 0..4 {
            assert_eq!(reg.acquire_for_pipeline(), Some(expected));
        }
        assert_eq!(reg.acquire_for_pipeline(), None);
        assert_eq!(reg.counts().busy, 4);

        reg.mark_complete(2).unwrap();
        assert_eq!(reg.state(2).unwrap(), SlotState::Done);
        assert_eq!(reg.counts().busy, 3);

        reg.consume(2).unwrap();
        assert_eq!(reg.state(2).unwrap(), SlotState::Free);

        reg.mark_error(0).unwrap();
        assert_eq!(reg.state(0).unwrap(), SlotState::Free);
        assert!(reg.descriptor(0).is_none());
        reg.assert_consistent();
    }

    #[test]
    fn descriptor_carries_base_and_use_count() {
        let mut reg = registry(2);
        let id = reg.acquire_for_pipeline().unwrap();
        let desc = reg.mark_complete(id).unwrap();
        desc.crop_frame_id = 7;

        let done = reg.peek_done().unwrap();
        assert_eq!(done.slot_id, 0);
        assert_eq!(done.base, 0x8000_0000);
        assert_eq!(done.use_count, 1);
        assert_eq!(done.crop_frame_id, 7);

        reg.consume(id).unwrap();
        reg.acquire_for_pipeline();
        let id = reg.acquire_for_pipeline().unwrap();
        assert_eq!(id, 0);
        let desc = reg.mark_complete(id).unwrap();
        assert_eq!(desc.use_count, 2);
        assert_eq!(desc.crop_frame_id, 0);
    }

    #[test]
    fn slot_base_arithmetic() {
        let reg = registry(4);
        assert_eq!(reg.slot_base(3), 0x8000_0000 + 3 * SLOT);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut reg = registry(2);
        assert!(matches!(reg.mark_complete(0), Err(IpuError::SlotNotBusy(0))));
        assert!(matches!(reg.mark_error(1), Err(IpuError::SlotNotBusy(1))));
        assert!(matches!(reg.consume(0), Err(IpuError::SlotNotDone(0))));
        assert!(matches!(reg.consume(9), Err(IpuError::InvalidSlot(9))));

        let id = reg.acquire_for_pipeline().unwrap();
        assert!(matches!(reg.consume(id), Err(IpuError::SlotNotDone(_))));
        reg.mark_complete(id).unwrap();
        assert!(matches!(reg.mark_error(id), Err(IpuError::SlotNotBusy(_))));
        assert!(matches!(reg.mark_complete(id), Err(IpuError::SlotNotBusy(_))));
        reg.assert_consistent();
    }

    #[test]
    fn peek_done_is_oldest_and_never_free_or_busy() {
        let mut reg = registry(3);
        assert!(reg.peek_done().is_none());
        let a = reg.acquire_for_pipeline().unwrap();
        let b = reg.acquire_for_pipeline().unwrap();
        reg.mark_complete(b).unwrap();
        reg.mark_complete(a).unwrap();
        assert_eq!(reg.peek_done().unwrap().slot_id, b);
        reg.consume(b).unwrap();
        assert_eq!(reg.peek_done().unwrap().slot_id, a);
        assert_eq!(reg.state(reg.peek_done().unwrap().slot_id).unwrap(), SlotState::Done);
    }

    #[test]
    fn drain_returns_everything_to_free() {
        let mut reg = registry(4);
        let a = reg.acquire_for_pipeline().unwrap();
        reg.acquire_for_pipeline();
        reg.mark_complete(a).unwrap();
        assert_eq!(reg.drain(), 2);
        assert_eq!(
            reg.counts(),
            SlotCounts {
                free: 4,
                busy: 0,
                done: 0
            }
        );
        assert!(reg.peek_done().is_none());
        reg.assert_consistent();
    }

    #[test]
    fn random_operation_sequences_keep_ownership_exclusive() {
        // Small LCG so the walk is deterministic.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        let mut reg = registry(5);
        for _ in 0..2000 {
            let id = next() % 6;
            match next() % 5 {
                0 | 1 => {
                    reg.acquire_for_pipeline();
                }
                2 => {
                    let _ = reg.mark_complete(id);
                }
                3 => {
                    let _ = reg.mark_error(id);
                }
                _ => {
                    let _ = reg.consume(id);
                }
            }
            reg.assert_consistent();
            if let Some(done) = reg.peek_done() {
                assert_eq!(reg.state(done.slot_id).unwrap(), SlotState::Done);
            }
        }
    }

    #[test]
    fn geometry_validation() {
        let geo = PoolGeometry::new(0x1000_0000, 8 * SLOT, SLOT, 0).unwrap();
        assert_eq!(geo.slot_count, 8);
        assert_eq!(geo.slot_base(2), 0x1000_0000 + 2 * SLOT);
        assert!(PoolGeometry::new(0, 4 * SLOT, SLOT, 5).is_err());
        assert!(PoolGeometry::new(0, 4 * SLOT, 0, 1).is_err());
        assert!(PoolGeometry::new(3, 4 * SLOT, SLOT, 1).is_err());
        assert!(matches!(
            PoolGeometry::new(u64::MAX - 15, 4 * SLOT, SLOT, 4),
            Err(IpuError::InvalidPool(_))
        ));
        let top = PoolGeometry::new(u64::MAX - 4 * SLOT - 15, 4 * SLOT, SLOT, 4).unwrap();
        assert_eq!(top.slot_base(3), u64::MAX - SLOT - 15);
    }
}
