//! Backing executables: the device the VM core demand-loads pages from.
use crate::error::{Result, VmError};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::marker::{Send, Sync};
use spin::Mutex;

pub trait ExecutableReader: Send + Sync + Any {
    /// Reads up to `buf.len()` bytes starting at byte `offset` of the executable into `buf`.
    ///
    /// Returns the number of bytes read, which is short only at the end of the file.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize>;
}

pub trait ExecutableLoader: Send + Sync {
    /// Opens the executable stored under `path`.
    fn open(&self, path: &str) -> Result<Arc<dyn ExecutableReader>>;
}

impl ExecutableReader for Vec<u8> {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

/// Loader serving executables kept in memory, keyed by path.
#[derive(Default)]
pub struct MemoryLoader {
    files: Mutex<BTreeMap<String, Arc<dyn ExecutableReader>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `image` under `path`, replacing any previous image.
    pub fn insert(&self, path: &str, image: Vec<u8>) {
        self.files.lock().insert(String::from(path), Arc::new(image));
    }
}

impl ExecutableLoader for MemoryLoader {
    fn open(&self, path: &str) -> Result<Arc<dyn ExecutableReader>> {
        self.files
            .lock()
            .get(path)
            .map(Arc::clone)
            .ok_or(VmError::NotFound)
    }
}
