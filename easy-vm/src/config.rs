//! Constants and runtime configuration of the VM core

/// 128 bytes, one disk sector of the emulated machine
pub const PAGE_SIZE: usize = 0x80;
/// Bit width of intra-page offset
pub const PAGE_SIZE_BITS: usize = 0x7;
/// 1024 bytes == 8 pages, appended after the uninitialized data segment
pub const USER_STACK_SIZE: usize = 1024;
/// Number of physical frames of the emulated machine.
pub const NUM_PHYS_PAGES: usize = 32;
/// Distance kept between the initial stack pointer and the end of the address space.
pub const STACK_TOP_PADDING: usize = 16;

/// Magic word at the head of every NOFF executable.
pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// Page replacement policy used when a fault finds no free frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// No policy configured. Any page fault is a fatal configuration error.
    Disabled,
    /// Evict the oldest admitted, unpinned frame.
    Fifo,
}

/// Runtime configuration of a [`PhysicalMemoryManager`](crate::PhysicalMemoryManager).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames of the machine.
    pub num_frames: usize,
    /// Replacement policy consulted on page faults.
    pub policy: ReplacementPolicy,
}

impl VmConfig {
    pub fn new(num_frames: usize, policy: ReplacementPolicy) -> Self {
        assert!(num_frames > 0, "physical memory needs at least one frame");
        Self { num_frames, policy }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new(NUM_PHYS_PAGES, ReplacementPolicy::Fifo)
    }
}
