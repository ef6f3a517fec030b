//! Implementation of [`PageTableEntry`] and [`PageTable`].
//!
//! The emulated machine walks a single linear table indexed by virtual page
//! number, so unlike a multi-level table there are no interior nodes.

use crate::address::{PhysPageNum, VirtPageNum};
use alloc::vec::Vec;
use bitflags::*;

bitflags! {
    /// translation entry flags
    pub struct PTEFlags: u8 {
        /// Valid:
        /// - the entry maps a resident frame; an access to an invalid entry page faults.
        const V = 1 << 0;
        /// Used:
        /// - set by the machine whenever the page is referenced.
        const U = 1 << 1;
        /// Dirty:
        /// - set by the machine whenever the page is written.
        const D = 1 << 2;
        /// Read-only:
        /// - writes to the page are rejected.
        const RO = 1 << 3;
        /// Shared:
        /// - the frame belongs to a shared-memory region and may be mapped by several page tables.
        const S = 1 << 4;
        /// Staged:
        /// - the page content waits in the address space's staging buffer
        ///   and is copied from there, not from the executable, on the next fault.
        const B = 1 << 5;
    }
}

/// Flags an entry inherits verbatim when its address space is duplicated.
pub const INHERITED_FLAGS: PTEFlags = PTEFlags {
    bits: PTEFlags::U.bits | PTEFlags::D.bits | PTEFlags::RO.bits | PTEFlags::S.bits,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// translation entry of one virtual page
pub struct PageTableEntry {
    pub vpn: VirtPageNum,
    /// Frame backing the page. Kept after invalidation, meaningful only while valid.
    pub ppn: Option<PhysPageNum>,
    pub flags: PTEFlags,
}

impl PageTableEntry {
    /// An invalid, private, writable entry.
    pub fn empty(vpn: VirtPageNum) -> Self {
        PageTableEntry {
            vpn,
            ppn: None,
            flags: PTEFlags::empty(),
        }
    }

    /// A valid entry for a pinned shared frame.
    pub fn shared(vpn: VirtPageNum, ppn: PhysPageNum) -> Self {
        PageTableEntry {
            vpn,
            ppn: Some(ppn),
            flags: PTEFlags::V | PTEFlags::S,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(PTEFlags::V)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(PTEFlags::S)
    }

    pub fn is_staged(&self) -> bool {
        self.flags.contains(PTEFlags::B)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PTEFlags::D)
    }

    pub fn is_used(&self) -> bool {
        self.flags.contains(PTEFlags::U)
    }

    pub fn writable(&self) -> bool {
        !self.flags.contains(PTEFlags::RO)
    }

    /// Frame of a valid entry.
    pub fn frame(&self) -> Option<PhysPageNum> {
        if self.is_valid() {
            self.ppn
        } else {
            None
        }
    }

    /// Point the entry at `ppn` and make it valid.
    pub fn map(&mut self, ppn: PhysPageNum) {
        self.ppn = Some(ppn);
        self.flags |= PTEFlags::V;
    }

    /// Drop residency. Content of a dirty page is lost.
    pub fn invalidate(&mut self) {
        self.flags.remove(PTEFlags::V);
    }
}

/// # Page table
///
/// One entry per virtual page of an address space; the index of an entry is
/// its virtual page number.
#[derive(Clone, Debug, Default)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    /// Table of `page_count` invalid entries.
    pub fn new(page_count: usize) -> Self {
        PageTable {
            entries: (0..page_count)
                .map(|vpn| PageTableEntry::empty(VirtPageNum(vpn)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry of `vpn`, or `None` past the end of the table.
    pub fn find_pte(&self, vpn: VirtPageNum) -> Option<&PageTableEntry> {
        self.entries.get(vpn.0)
    }

    pub fn find_pte_mut(&mut self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(vpn.0)
    }

    /// Copy of the entry of `vpn` when it is valid.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn).filter(|pte| pte.is_valid()).copied()
    }

    /// Append an entry at the high end. Its vpn must be the next index.
    pub fn push(&mut self, pte: PageTableEntry) {
        assert_eq!(pte.vpn.0, self.entries.len(), "page table grows at its end");
        self.entries.push(pte);
    }

    pub fn iter(&self) -> core::slice::Iter<'_, PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> core::slice::IterMut<'_, PageTableEntry> {
        self.entries.iter_mut()
    }
}
