//! Physical memory of the emulated machine and [`PhysicalMemoryManager`],
//! the single owner of the frame table and eviction queue.

use crate::address::{PhysAddr, PhysPageNum};
use crate::address_space::AddressSpace;
use crate::config::{ReplacementPolicy, VmConfig, PAGE_SIZE};
use crate::frame_allocator::{FifoFrameAllocator, FrameAllocator};
use crate::process::ProcessId;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

type FrameAllocatorImpl = FifoFrameAllocator;

/// Byte content of one frame.
pub type FrameBytes = Box<[u8; PAGE_SIZE]>;

/// Addressable physical memory, one lock per frame so that processes
/// sharing a frame serialize on that frame only.
pub struct PhysicalMemory {
    frames: Vec<Mutex<FrameBytes>>,
}

impl PhysicalMemory {
    pub fn new(num_frames: usize) -> Self {
        Self {
            frames: (0..num_frames)
                .map(|_| Mutex::new(Box::new([0u8; PAGE_SIZE])))
                .collect(),
        }
    }

    /// Get exclusive access to the bytes of one frame.
    pub fn frame(&self, ppn: PhysPageNum) -> MutexGuard<'_, FrameBytes> {
        self.frames[ppn.0].lock()
    }

    pub fn zero(&self, ppn: PhysPageNum) {
        self.frame(ppn).fill(0);
    }

    /// Copy `buf.len()` bytes starting at `pa`. The range must not cross a frame.
    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let offset = pa.page_offset();
        buf.copy_from_slice(&self.frame(pa.floor())[offset..offset + buf.len()]);
    }

    /// Store `data` starting at `pa`. The range must not cross a frame.
    pub fn write(&self, pa: PhysAddr, data: &[u8]) {
        let offset = pa.page_offset();
        self.frame(pa.floor())[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Counters kept alongside the frame table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Faults resolved, as the kernel's `numPageFaults`.
    pub page_faults: usize,
    /// Frames taken from their owner by the replacement policy.
    pub evictions: usize,
    /// Frames currently in use.
    pub resident_frames: usize,
    /// Frames currently pinned by shared memory.
    pub pinned_frames: usize,
}

/// State guarded by the frame-table lock.
pub struct FrameManagerInner {
    pub allocator: FrameAllocatorImpl,
    pub page_faults: usize,
    pub evictions: usize,
}

impl FrameManagerInner {
    /// A frame nobody uses: the first free one, or else the oldest resident
    /// frame, after unmapping it from the owner `lookup` finds for it.
    ///
    /// The frame comes back released; the caller claims it.
    pub fn obtain<F>(&mut self, lookup: F) -> Option<PhysPageNum>
    where
        F: Fn(ProcessId) -> Option<Arc<AddressSpace>>,
    {
        if let Some(ppn) = self.allocator.alloc() {
            return Some(ppn);
        }
        let victim = self.allocator.evict()?;
        if let Some(owner) = lookup(victim.owner) {
            owner
                .inner_exclusive_access()
                .invalidate(victim.vpn, victim.ppn);
        }
        self.evictions += 1;
        Some(victim.ppn)
    }
}

/// Owner of everything global about physical memory.
///
/// Constructed once at startup and handed by reference to every component
/// that needs frames. Lock order: this manager's lock is taken before any
/// address-space lock, and frame byte locks are taken last.
pub struct PhysicalMemoryManager {
    config: VmConfig,
    inner: Mutex<FrameManagerInner>,
    memory: PhysicalMemory,
}

impl PhysicalMemoryManager {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(FrameManagerInner {
                allocator: FrameAllocatorImpl::new(config.num_frames),
                page_faults: 0,
                evictions: 0,
            }),
            memory: PhysicalMemory::new(config.num_frames),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.config.policy
    }

    /// Lock the frame table and eviction queue as one unit.
    pub fn exclusive_access(&self) -> MutexGuard<'_, FrameManagerInner> {
        self.inner.lock()
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn stats(&self) -> VmStats {
        let inner = self.exclusive_access();
        let table = inner.allocator.table();
        VmStats {
            page_faults: inner.page_faults,
            evictions: inner.evictions,
            resident_frames: table.in_use_count(),
            pinned_frames: table.pinned_count(),
        }
    }
}
