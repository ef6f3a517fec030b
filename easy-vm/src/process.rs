//! Implementation of [`ProcessId`] and the id allocator
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};

/// Process identifier used as the ownership tag of a frame.
///
/// It is a plain value rather than a handle: whether the process is still
/// alive is answered by a registry lookup, never by dereferencing it.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ProcessId(pub usize);

impl Debug for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PID:{}", self.0))
    }
}

/// Allocator to manage new ID assignment/reassignment/deletion, etc.
pub struct RecycleAllocator {
    /// Start position of unassigned id
    current: usize,
    recycled: Vec<usize>,
}

impl RecycleAllocator {
    ///Create an empty `RecycleAllocator`
    pub fn new() -> Self {
        RecycleAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }

    ///Allocate a id(identifier)
    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    ///Recycle a id(identifier)
    pub fn dealloc(&mut self, id: usize) {
        assert!(id < self.current);
        assert!(
            !self.recycled.iter().any(|i| *i == id),
            "id {} has been deallocated!",
            id
        );
        self.recycled.push(id);
    }
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
