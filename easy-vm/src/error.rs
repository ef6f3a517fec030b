//! Error type of the VM core
use crate::process::ProcessId;
use crate::address::VirtAddr;
use thiserror::Error;

/// Failures surfaced to the syscall layer.
///
/// Ordinary page faults are not errors: they are resolved internally and only
/// a misconfigured machine (no replacement policy, nothing evictable) turns
/// one into a kernel panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The executable header magic does not match, even after a byte swap.
    #[error("bad executable format: magic {magic:#x}")]
    BadExecutableFormat { magic: u32 },
    /// No free or evictable frame is left for a pinned shared-memory request.
    #[error("out of physical memory: {requested} pinned frames requested, {available} obtainable")]
    OutOfPhysicalMemory { requested: usize, available: usize },
    /// The address space needs more pages than the machine has frames.
    #[error("address space of {pages} pages exceeds {frames} physical frames")]
    ExhaustedAddressSpaceBudget { pages: usize, frames: usize },
    /// The loader has no executable under this path.
    #[error("executable not found")]
    NotFound,
    /// Reading the backing executable failed.
    #[error("executable I/O error at offset {offset}")]
    Io { offset: usize },
    /// The process id does not name a live address space.
    #[error("no such process: {0:?}")]
    NoSuchProcess(ProcessId),
    /// The virtual address lies past the end of the address space.
    #[error("address {0:?} out of range")]
    AddressOutOfRange(VirtAddr),
    /// A write hit a read-only page.
    #[error("write to read-only address {0:?}")]
    ReadOnlyViolation(VirtAddr),
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, VmError>;
