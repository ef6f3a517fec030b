//! Implementation of [`FrameAllocator`] which
//! controls all the frames in the emulated machine.

use crate::address::{PhysPageNum, VirtPageNum};
use crate::frame_table::FrameTable;
use crate::process::ProcessId;
use alloc::collections::VecDeque;
use log::debug;

/// A frame taken away from its owner by the replacement policy.
///
/// The caller must invalidate `owner`'s translation entry for `vpn`
/// before the frame's bytes are overwritten.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Victim {
    pub ppn: PhysPageNum,
    pub owner: ProcessId,
    pub vpn: VirtPageNum,
}

pub trait FrameAllocator {
    fn new(num_frames: usize) -> Self;
    /// First free frame, if any. The frame is not claimed.
    fn alloc(&mut self) -> Option<PhysPageNum>;
    /// Take the next victim out of the resident set and free its frame.
    fn evict(&mut self) -> Option<Victim>;
    /// Mark `ppn` in use by `owner` at `vpn` without making it evictable yet.
    fn claim(&mut self, ppn: PhysPageNum, owner: ProcessId, vpn: VirtPageNum, pinned: bool);
    /// Make a claimed frame evictable. Ignored for pinned frames and for
    /// frames whose ownership changed since the claim.
    fn admit(&mut self, ppn: PhysPageNum, owner: ProcessId, vpn: VirtPageNum) -> bool;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

/// FIFO replacement: frames are evicted strictly in admission order.
pub struct FifoFrameAllocator {
    table: FrameTable,
    /// Admission order of resident, unpinned frames. Head is the oldest.
    queue: VecDeque<PhysPageNum>,
}

impl FifoFrameAllocator {
    pub fn table(&self) -> &FrameTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut FrameTable {
        &mut self.table
    }

    /// Frames a request could obtain right now, by allocation or eviction.
    pub fn obtainable(&self) -> usize {
        self.table.free_count() + self.queue.len()
    }

    /// Snapshot of the eviction queue, oldest first.
    pub fn queue(&self) -> impl Iterator<Item = PhysPageNum> + '_ {
        self.queue.iter().copied()
    }
}

impl FrameAllocator for FifoFrameAllocator {
    fn new(num_frames: usize) -> Self {
        Self {
            table: FrameTable::new(num_frames),
            queue: VecDeque::new(),
        }
    }

    fn alloc(&mut self) -> Option<PhysPageNum> {
        self.table.find_free()
    }

    fn evict(&mut self) -> Option<Victim> {
        let ppn = self.queue.pop_front()?;
        let entry = *self.table.get(ppn);
        assert!(
            entry.in_use && !entry.pinned,
            "{:?} in eviction queue is not an evictable frame",
            ppn
        );
        let (owner, vpn) = match (entry.owner, entry.owner_vpn) {
            (Some(owner), Some(vpn)) => (owner, vpn),
            _ => panic!("{:?} in eviction queue has no owner", ppn),
        };
        self.table.release(ppn);
        debug!("evict {:?} from {:?} {:?}", ppn, owner, vpn);
        Some(Victim { ppn, owner, vpn })
    }

    fn claim(&mut self, ppn: PhysPageNum, owner: ProcessId, vpn: VirtPageNum, pinned: bool) {
        self.table.claim(ppn, owner, vpn, pinned);
    }

    fn admit(&mut self, ppn: PhysPageNum, owner: ProcessId, vpn: VirtPageNum) -> bool {
        let entry = self.table.get(ppn);
        if !entry.is_owned_by(owner, vpn) || entry.pinned {
            return false;
        }
        debug_assert!(!self.queue.contains(&ppn));
        self.queue.push_back(ppn);
        true
    }

    fn dealloc(&mut self, ppn: PhysPageNum) {
        self.queue.retain(|&queued| queued != ppn);
        self.table.release(ppn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use pretty_assertions::assert_eq;

    fn admit_next(fifo: &mut FifoFrameAllocator, vpn: usize) -> PhysPageNum {
        let ppn = fifo.alloc().unwrap();
        fifo.claim(ppn, ProcessId(1), VirtPageNum(vpn), false);
        assert!(fifo.admit(ppn, ProcessId(1), VirtPageNum(vpn)));
        ppn
    }

    #[test]
    fn eviction_follows_admission_order() {
        let mut fifo = FifoFrameAllocator::new(3);
        let order: Vec<_> = (0..3).map(|vpn| admit_next(&mut fifo, vpn)).collect();
        assert_eq!(fifo.alloc(), None);
        for (i, expected) in order.iter().enumerate() {
            let victim = fifo.evict().unwrap();
            assert_eq!(victim.ppn, *expected);
            assert_eq!(victim.vpn, VirtPageNum(i));
            // the freed frame goes straight to the requester
            fifo.claim(victim.ppn, ProcessId(2), VirtPageNum(10 + i), false);
            fifo.admit(victim.ppn, ProcessId(2), VirtPageNum(10 + i));
        }
        assert_eq!(fifo.evict().unwrap().owner, ProcessId(2));
    }

    #[test]
    fn pinned_frames_are_never_queued() {
        let mut fifo = FifoFrameAllocator::new(2);
        let pinned = fifo.alloc().unwrap();
        fifo.claim(pinned, ProcessId(1), VirtPageNum(0), true);
        assert!(!fifo.admit(pinned, ProcessId(1), VirtPageNum(0)));
        admit_next(&mut fifo, 1);
        assert_eq!(fifo.queue().collect::<Vec<_>>(), [PhysPageNum(1)]);
        assert_eq!(fifo.evict().unwrap().ppn, PhysPageNum(1));
        assert_eq!(fifo.evict(), None);
        assert_eq!(fifo.obtainable(), 1);
    }

    #[test]
    fn dealloc_drops_frame_from_queue() {
        let mut fifo = FifoFrameAllocator::new(3);
        let first = admit_next(&mut fifo, 0);
        let second = admit_next(&mut fifo, 1);
        fifo.dealloc(first);
        assert_eq!(fifo.evict().unwrap().ppn, second);
        assert_eq!(fifo.table().in_use_count(), 0);
    }

    #[test]
    fn stale_admission_is_ignored() {
        let mut fifo = FifoFrameAllocator::new(1);
        let ppn = fifo.alloc().unwrap();
        fifo.claim(ppn, ProcessId(1), VirtPageNum(0), false);
        fifo.dealloc(ppn);
        assert!(!fifo.admit(ppn, ProcessId(1), VirtPageNum(0)));
        assert_eq!(fifo.evict(), None);
    }
}
