//!Demand-paged virtual memory for a small teaching kernel
#![cfg_attr(not(test), no_std)]
extern crate alloc;
pub mod address;
pub mod address_space;
pub mod config;
mod error;
pub mod executable;
pub mod fault;
pub mod frame_allocator;
pub mod frame_table;
pub mod memory;
pub mod noff;
pub mod page_table;
pub mod process;
mod vmm;

pub use address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use address_space::AddressSpace;
pub use config::{ReplacementPolicy, VmConfig, PAGE_SIZE};
pub use error::{Result, VmError};
pub use executable::{ExecutableLoader, ExecutableReader, MemoryLoader};
pub use fault::Fault;
pub use memory::{PhysicalMemoryManager, VmStats};
pub use noff::{NoffHeader, Segment};
pub use process::ProcessId;
pub use vmm::VirtualMemory;
