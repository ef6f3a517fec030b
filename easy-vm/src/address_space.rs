//! Implementation of [`AddressSpace`].

use crate::address::{PhysAddr, PhysPageNum, VPNRange, VirtAddr, VirtPageNum};
use crate::config::{PAGE_SIZE, STACK_TOP_PADDING, USER_STACK_SIZE};
use crate::error::{Result, VmError};
use crate::executable::ExecutableReader;
use crate::memory::PhysicalMemory;
use crate::noff::NoffHeader;
use crate::page_table::{PTEFlags, PageTable, PageTableEntry, INHERITED_FLAGS};
use crate::process::ProcessId;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::debug;
use spin::{Mutex, MutexGuard};

/// Expressing the address space of one user process.
///
/// The first `page_count - shared_page_count` pages are private and demand
/// loaded, either from the backing executable or from the staging buffer that
/// a fork filled. Shared-memory pages follow at the high end and are always
/// resident in pinned frames.
pub struct AddressSpace {
    pid: ProcessId,
    /// Handle of the backing executable, kept open for the life of the process.
    executable: Arc<dyn ExecutableReader>,
    header: NoffHeader,
    inner: Mutex<AddressSpaceInner>,
}

pub struct AddressSpaceInner {
    page_count: usize,
    shared_page_count: usize,
    page_table: PageTable,
    /// Content of pages inherited at fork time and not yet resident,
    /// `page_count * PAGE_SIZE` bytes laid out by virtual page number.
    staging: Vec<u8>,
    /// Set once the owning process exited. No page may become resident again.
    exited: bool,
}

impl AddressSpace {
    /// Builds the address space of a process starting from `executable`.
    ///
    /// Nothing is read besides the header and no frame is reserved: every
    /// page is loaded on its first fault.
    pub fn from_executable(
        pid: ProcessId,
        executable: Arc<dyn ExecutableReader>,
        num_frames: usize,
    ) -> Result<Self> {
        let header = NoffHeader::read_from(executable.as_ref())?;
        let size = header.image_size() + USER_STACK_SIZE;
        let page_count = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        if page_count > num_frames {
            return Err(VmError::ExhaustedAddressSpaceBudget {
                pages: page_count,
                frames: num_frames,
            });
        }
        debug!(
            "{:?}: initializing address space, num pages {}, size {}",
            pid,
            page_count,
            page_count * PAGE_SIZE
        );
        Ok(Self {
            pid,
            executable,
            header,
            inner: Mutex::new(AddressSpaceInner {
                page_count,
                shared_page_count: 0,
                page_table: PageTable::new(page_count),
                staging: vec![0u8; page_count * PAGE_SIZE],
                exited: false,
            }),
        })
    }

    /// Duplicate `parent` for a forked child.
    ///
    /// The parent's table is snapshotted under the parent's lock, and the
    /// caller must hold the frame-table lock so that no resident parent frame
    /// is evicted halfway through the copy.
    ///
    /// - valid private page: its bytes are copied into the child's staging
    ///   buffer and the child entry is staged but not resident.
    /// - valid shared page: the child maps the very same frame.
    /// - staged, not resident page: the parent's staged bytes are copied.
    pub fn from_existed_user(
        pid: ProcessId,
        parent: &AddressSpace,
        memory: &PhysicalMemory,
        num_frames: usize,
    ) -> Result<Self> {
        let parent_inner = parent.inner_exclusive_access();
        let page_count = parent_inner.page_count;
        let shared_page_count = parent_inner.shared_page_count;
        if page_count - shared_page_count > num_frames {
            return Err(VmError::ExhaustedAddressSpaceBudget {
                pages: page_count - shared_page_count,
                frames: num_frames,
            });
        }
        let mut page_table = PageTable::new(0);
        let mut staging = vec![0u8; page_count * PAGE_SIZE];
        for parent_pte in parent_inner.page_table.iter() {
            let vpn = parent_pte.vpn;
            let range = vpn.byte_offset()..vpn.byte_offset() + PAGE_SIZE;
            let mut pte = PageTableEntry::empty(vpn);
            pte.flags = parent_pte.flags & INHERITED_FLAGS;
            match parent_pte.frame() {
                Some(ppn) if parent_pte.is_shared() => pte.map(ppn),
                Some(ppn) => {
                    staging[range].copy_from_slice(&memory.frame(ppn)[..]);
                    pte.flags |= PTEFlags::B;
                }
                None if parent_pte.is_staged() => {
                    staging[range.clone()].copy_from_slice(&parent_inner.staging[range]);
                    pte.flags |= PTEFlags::B;
                }
                None => {}
            }
            page_table.push(pte);
        }
        debug!(
            "{:?}: duplicated from {:?}, num pages {}, shared {}",
            pid, parent.pid, page_count, shared_page_count
        );
        Ok(Self {
            pid,
            executable: Arc::clone(&parent.executable),
            header: parent.header,
            inner: Mutex::new(AddressSpaceInner {
                page_count,
                shared_page_count,
                page_table,
                staging,
                exited: false,
            }),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn inner_exclusive_access(&self) -> MutexGuard<'_, AddressSpaceInner> {
        self.inner.lock()
    }

    /// Initial value of the user stack register: the end of the private
    /// region minus a little padding.
    pub fn initial_stack_pointer(&self) -> usize {
        let inner = self.inner_exclusive_access();
        (inner.page_count - inner.shared_page_count) * PAGE_SIZE - STACK_TOP_PADDING
    }

    /// Fill frame `ppn` with the content of page `vpn` and map it.
    ///
    /// Staged pages come from the staging buffer. Other pages are zero
    /// filled, then the parts of the code and initialized data segments
    /// that fall inside the page are read from the executable. The caller
    /// holds this address space's lock, so the read does not block faults
    /// of other processes.
    pub fn replace_page(
        &self,
        inner: &mut AddressSpaceInner,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        memory: &PhysicalMemory,
    ) -> Result<()> {
        let base = vpn.byte_offset();
        let mut page = [0u8; PAGE_SIZE];
        let pte = inner
            .page_table
            .find_pte(vpn)
            .ok_or(VmError::AddressOutOfRange(vpn.into()))?;
        if pte.is_staged() {
            page.copy_from_slice(&inner.staging[base..base + PAGE_SIZE]);
        } else {
            for segment in self.header.loadable_segments() {
                let range = segment.virtual_range();
                let start = range.start.max(base);
                let end = range.end.min(base + PAGE_SIZE);
                if start >= end {
                    continue;
                }
                let offset = segment.in_file_addr as usize + (start - range.start);
                let dst = &mut page[start - base..end - base];
                if self.executable.read_at(offset, dst)? < dst.len() {
                    return Err(VmError::Io { offset });
                }
            }
        }
        memory.frame(ppn).copy_from_slice(&page);
        inner.map(vpn, ppn);
        Ok(())
    }
}

impl AddressSpaceInner {
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn shared_page_count(&self) -> usize {
        self.shared_page_count
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(vpn)
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    /// Is `vpn` inside this address space?
    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        vpn.0 < self.page_count
    }

    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum) {
        if let Some(pte) = self.page_table.find_pte_mut(vpn) {
            pte.map(ppn);
        }
    }

    /// Translate `va` the way the machine does on every access.
    ///
    /// Sets the used bit, and the dirty bit on writes. Returns `Ok(None)`
    /// when the page is not resident, i.e. the access page faults.
    pub fn access(&mut self, va: VirtAddr, write: bool) -> Result<Option<PhysAddr>> {
        let pte = self
            .page_table
            .find_pte_mut(va.floor())
            .ok_or(VmError::AddressOutOfRange(va))?;
        if write && !pte.writable() {
            return Err(VmError::ReadOnlyViolation(va));
        }
        let ppn = match pte.frame() {
            Some(ppn) => ppn,
            None => return Ok(None),
        };
        pte.flags |= PTEFlags::U;
        if write {
            pte.flags |= PTEFlags::D;
        }
        let pa: PhysAddr = ppn.into();
        Ok(Some(PhysAddr(pa.0 + va.page_offset())))
    }

    /// Drop the mapping of `vpn` if it still points at `ppn`.
    pub fn invalidate(&mut self, vpn: VirtPageNum, ppn: PhysPageNum) -> bool {
        match self.page_table.find_pte_mut(vpn) {
            Some(pte) if pte.frame() == Some(ppn) => {
                pte.invalidate();
                true
            }
            _ => false,
        }
    }

    /// Append shared pages backed by the pinned `frames`.
    ///
    /// # Return
    /// The virtual address of the first new page.
    pub fn append_shared(&mut self, frames: &[PhysPageNum]) -> VirtAddr {
        let start = VirtPageNum(self.page_count);
        let range = VPNRange::new(start, VirtPageNum(start.0 + frames.len()));
        for (vpn, &ppn) in range.into_iter().zip(frames) {
            self.page_table.push(PageTableEntry::shared(vpn, ppn));
        }
        self.page_count += frames.len();
        self.shared_page_count += frames.len();
        self.staging.resize(self.page_count * PAGE_SIZE, 0);
        start.into()
    }

    /// Frames mapped by shared pages.
    pub fn shared_frames(&self) -> impl Iterator<Item = PhysPageNum> + '_ {
        self.page_table
            .iter()
            .filter(|pte| pte.is_shared())
            .filter_map(|pte| pte.frame())
    }

    /// Invalidate every resident page and hand back `(vpn, frame, shared)`
    /// for each of them, for the caller to return to the frame table.
    pub fn recycle_data_pages(&mut self) -> Vec<(VirtPageNum, PhysPageNum, bool)> {
        self.exited = true;
        let mut resident = Vec::new();
        for pte in self.page_table.iter_mut() {
            if let Some(ppn) = pte.frame() {
                resident.push((pte.vpn, ppn, pte.is_shared()));
                pte.invalidate();
            }
        }
        resident
    }
}
