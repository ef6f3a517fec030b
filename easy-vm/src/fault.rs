//! Page fault resolution.
//!
//! A faulting thread walks `Faulted -> Resolving -> Populated -> admitted`.
//! The frame-table lock is held while a frame is obtained and again when the
//! populated frame is admitted, but never while the executable is read.

use crate::address::{PhysPageNum, VirtAddr, VirtPageNum};
use crate::address_space::AddressSpace;
use crate::config::ReplacementPolicy;
use crate::error::{Result, VmError};
use crate::frame_allocator::FrameAllocator;
use crate::memory::PhysicalMemoryManager;
use crate::process::ProcessId;
use alloc::sync::Arc;
use log::trace;

/// Outcome of a translation that did not produce a physical address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The page is not resident. Resolve it and retry the access.
    PageFault(VirtAddr),
    /// The access can never succeed.
    Exception(VmError),
}

impl From<VmError> for Fault {
    fn from(err: VmError) -> Self {
        Fault::Exception(err)
    }
}

/// A thread that touched a non-resident page.
pub struct Faulted<'a> {
    manager: &'a PhysicalMemoryManager,
    space: Arc<AddressSpace>,
    vpn: VirtPageNum,
}

/// A frame has been obtained for the faulting page but holds nothing yet.
///
/// The frame is in use and owned by the faulting process, but it is not in
/// the eviction queue so nobody can take it away.
pub struct Resolving<'a> {
    manager: &'a PhysicalMemoryManager,
    space: Arc<AddressSpace>,
    vpn: VirtPageNum,
    ppn: PhysPageNum,
}

impl<'a> Faulted<'a> {
    /// Enter fault handling for an access to `va`.
    ///
    /// Returns `Ok(None)` when the page is already resident, which happens
    /// when another thread of the same process resolved it first.
    pub fn new(
        manager: &'a PhysicalMemoryManager,
        space: Arc<AddressSpace>,
        va: VirtAddr,
    ) -> Result<Option<Self>> {
        let vpn = va.floor();
        {
            let inner = space.inner_exclusive_access();
            if !inner.contains(vpn) {
                return Err(VmError::AddressOutOfRange(va));
            }
            if inner.translate(vpn).is_some() {
                return Ok(None);
            }
        }
        trace!("{:?}: page fault at {:?}", space.pid(), va);
        Ok(Some(Self {
            manager,
            space,
            vpn,
        }))
    }

    /// Take a free frame, or evict the oldest resident one.
    ///
    /// `lookup` maps the owner of a victim to its address space, if that
    /// process still exists.
    ///
    /// Frames held by other in-flight faults are not evictable yet. While
    /// any exist, the lock is released and the request retried until one of
    /// them is admitted.
    ///
    /// # Panic
    ///
    /// If no replacement policy is configured, or if every frame is pinned.
    pub fn obtain_frame<F>(self, lookup: F) -> Resolving<'a>
    where
        F: Fn(ProcessId) -> Option<Arc<AddressSpace>>,
    {
        if self.manager.policy() == ReplacementPolicy::Disabled {
            panic!("page fault with no page replacement policy");
        }
        let pid = self.space.pid();
        let ppn = loop {
            let mut frames = self.manager.exclusive_access();
            if let Some(ppn) = frames.obtain(&lookup) {
                frames.allocator.claim(ppn, pid, self.vpn, false);
                break ppn;
            }
            if frames.allocator.table().unpinned_in_use_count() == 0 {
                panic!("{:?}: no frame can be freed for {:?}", pid, self.vpn);
            }
            drop(frames);
            core::hint::spin_loop();
        };
        trace!("{:?}: {:?} resolving into {:?}", pid, self.vpn, ppn);
        Resolving {
            manager: self.manager,
            space: self.space,
            vpn: self.vpn,
            ppn,
        }
    }
}

impl<'a> Resolving<'a> {
    /// Fill the frame and map it.
    ///
    /// Returns `Ok(None)`, with the frame given back, when the page no longer
    /// needs it: the process exited, or another thread mapped the page.
    pub fn populate(self) -> Result<Option<Populated<'a>>> {
        let pid = self.space.pid();
        let mut inner = self.space.inner_exclusive_access();
        if inner.is_exited() || inner.translate(self.vpn).is_some() {
            drop(inner);
            trace!("{:?}: {:?} no longer needs {:?}", pid, self.vpn, self.ppn);
            self.manager.exclusive_access().allocator.dealloc(self.ppn);
            return Ok(None);
        }
        if let Err(err) = self
            .space
            .replace_page(&mut inner, self.vpn, self.ppn, self.manager.memory())
        {
            drop(inner);
            self.manager.exclusive_access().allocator.dealloc(self.ppn);
            return Err(err);
        }
        drop(inner);
        Ok(Some(Populated {
            manager: self.manager,
            space: self.space,
            vpn: self.vpn,
            ppn: self.ppn,
        }))
    }
}

/// The page is mapped to its frame, which is not evictable yet.
pub struct Populated<'a> {
    manager: &'a PhysicalMemoryManager,
    space: Arc<AddressSpace>,
    vpn: VirtPageNum,
    ppn: PhysPageNum,
}

impl<'a> Populated<'a> {
    /// Put the frame in the eviction queue.
    ///
    /// Skipped when the process exited in the meantime: its frames went back
    /// with the exit, and its id may already name a new process that owns
    /// the same frame at the same page.
    pub fn admit(self) {
        let pid = self.space.pid();
        let mut frames = self.manager.exclusive_access();
        frames.page_faults += 1;
        if self.space.inner_exclusive_access().is_exited() {
            trace!("{:?}: exited before {:?} was admitted", pid, self.ppn);
            return;
        }
        frames.allocator.admit(self.ppn, pid, self.vpn);
        trace!("{:?}: {:?} resolved", pid, self.vpn);
    }
}

/// Run a fault on `va` of `space` to completion. On success the page is
/// resident.
pub fn resolve<F>(
    manager: &PhysicalMemoryManager,
    space: Arc<AddressSpace>,
    va: VirtAddr,
    lookup: F,
) -> Result<()>
where
    F: Fn(ProcessId) -> Option<Arc<AddressSpace>>,
{
    if let Some(faulted) = Faulted::new(manager, space, va)? {
        if let Some(populated) = faulted.obtain_frame(lookup).populate()? {
            populated.admit();
        }
    }
    Ok(())
}
