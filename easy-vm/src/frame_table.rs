//! Implementation of [`FrameTable`], the descriptor array over all physical frames.

use crate::address::{PhysPageNum, VirtPageNum};
use crate::process::ProcessId;
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

/// Descriptor of one physical frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameTableEntry {
    /// Some translation entry maps this frame, or a fault is populating it.
    pub in_use: bool,
    /// Excluded from eviction. Set for shared memory.
    pub pinned: bool,
    /// Process that admitted the frame. Only an identity, never a handle.
    pub owner: Option<ProcessId>,
    /// Virtual page of `owner` mapped to this frame.
    pub owner_vpn: Option<VirtPageNum>,
    /// Page tables mapping a pinned shared frame.
    pub share_count: usize,
}

impl FrameTableEntry {
    /// Is the frame currently owned by `pid` at `vpn`?
    pub fn is_owned_by(&self, pid: ProcessId, vpn: VirtPageNum) -> bool {
        self.in_use && self.owner == Some(pid) && self.owner_vpn == Some(vpn)
    }
}

/// Global descriptor array, one [`FrameTableEntry`] per physical frame.
///
/// Free frames are additionally kept in an ordered set so that the first-fit
/// search does not scan the whole table.
pub struct FrameTable {
    entries: Vec<FrameTableEntry>,
    free: BTreeSet<PhysPageNum>,
}

impl FrameTable {
    pub fn new(num_frames: usize) -> Self {
        Self {
            entries: vec![FrameTableEntry::default(); num_frames],
            free: (0..num_frames).map(PhysPageNum).collect(),
        }
    }

    /// Number of physical frames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lowest numbered frame not in use.
    pub fn find_free(&self) -> Option<PhysPageNum> {
        self.free.iter().next().copied()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn pinned_count(&self) -> usize {
        self.entries.iter().filter(|e| e.pinned).count()
    }

    pub fn get(&self, ppn: PhysPageNum) -> &FrameTableEntry {
        &self.entries[ppn.0]
    }

    pub fn get_mut(&mut self, ppn: PhysPageNum) -> &mut FrameTableEntry {
        &mut self.entries[ppn.0]
    }

    /// Hand `ppn` to `owner` for its page `vpn`.
    ///
    /// # Panic
    ///
    /// If the frame is already in use. Victims must be released first.
    pub fn claim(&mut self, ppn: PhysPageNum, owner: ProcessId, vpn: VirtPageNum, pinned: bool) {
        let entry = &mut self.entries[ppn.0];
        assert!(!entry.in_use, "{:?} is already in use", ppn);
        entry.in_use = true;
        entry.pinned = pinned;
        entry.owner = Some(owner);
        entry.owner_vpn = Some(vpn);
        entry.share_count = if pinned { 1 } else { 0 };
        self.free.remove(&ppn);
    }

    /// Return `ppn` to the free pool and forget its owner.
    pub fn release(&mut self, ppn: PhysPageNum) {
        self.entries[ppn.0] = FrameTableEntry::default();
        self.free.insert(ppn);
    }

    /// Frames in use and not pinned. They are either queued for eviction or
    /// held by a fault that has not admitted them yet.
    pub fn unpinned_in_use_count(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use && !e.pinned).count()
    }
}
