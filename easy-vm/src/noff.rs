//! NOFF executable header.
//!
//! | Word | Meaning |
//! |------|---------|
//! | 0 | magic ([`NOFF_MAGIC`]) |
//! | 1..=3 | code: virtual address, offset in file, size |
//! | 4..=6 | initialized data: virtual address, offset in file, size |
//! | 7..=9 | uninitialized data: virtual address, offset in file, size |
//!
//! Words are little endian. An image produced on a foreign-endian host has
//! every word byte-swapped, which is detected through the magic.

use crate::config::NOFF_MAGIC;
use crate::error::{Result, VmError};
use crate::executable::ExecutableReader;
use core::ops::Range;

/// Size of the header in bytes.
pub const NOFF_HEADER_SIZE: usize = 40;

/// One segment of the executable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Location of the segment in the virtual address space.
    pub virtual_addr: u32,
    /// Location of the segment in the executable file.
    pub in_file_addr: u32,
    /// Size of the segment in bytes.
    pub size: u32,
}

impl Segment {
    pub fn new(virtual_addr: u32, in_file_addr: u32, size: u32) -> Self {
        Self {
            virtual_addr,
            in_file_addr,
            size,
        }
    }

    /// Virtual byte range covered by the segment.
    pub fn virtual_range(&self) -> Range<usize> {
        let start = self.virtual_addr as usize;
        start..start + self.size as usize
    }

    fn swap(&mut self) {
        self.virtual_addr = self.virtual_addr.swap_bytes();
        self.in_file_addr = self.in_file_addr.swap_bytes();
        self.size = self.size.swap_bytes();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NoffHeader {
    pub magic: u32,
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    pub fn new(code: Segment, init_data: Segment, uninit_data: Segment) -> Self {
        Self {
            magic: NOFF_MAGIC,
            code,
            init_data,
            uninit_data,
        }
    }

    /// Decode a header, normalizing the byte order when the image was
    /// written on a foreign-endian host.
    pub fn parse(raw: &[u8; NOFF_HEADER_SIZE]) -> Result<Self> {
        let mut words = [0u32; NOFF_HEADER_SIZE / 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&raw[i * 4..i * 4 + 4]);
            *word = u32::from_le_bytes(bytes);
        }
        let segment = |i: usize| Segment::new(words[i], words[i + 1], words[i + 2]);
        let mut header = Self {
            magic: words[0],
            code: segment(1),
            init_data: segment(4),
            uninit_data: segment(7),
        };
        if header.magic != NOFF_MAGIC && header.magic.swap_bytes() == NOFF_MAGIC {
            header.swap();
        }
        if header.magic != NOFF_MAGIC {
            return Err(VmError::BadExecutableFormat {
                magic: header.magic,
            });
        }
        Ok(header)
    }

    /// Read and decode the header at the start of `executable`.
    pub fn read_from(executable: &dyn ExecutableReader) -> Result<Self> {
        let mut raw = [0u8; NOFF_HEADER_SIZE];
        let n = executable.read_at(0, &mut raw)?;
        if n < NOFF_HEADER_SIZE {
            return Err(VmError::Io { offset: n });
        }
        Self::parse(&raw)
    }

    /// Encode the header in the native little-endian layout.
    pub fn to_bytes(&self) -> [u8; NOFF_HEADER_SIZE] {
        let words = [
            self.magic,
            self.code.virtual_addr,
            self.code.in_file_addr,
            self.code.size,
            self.init_data.virtual_addr,
            self.init_data.in_file_addr,
            self.init_data.size,
            self.uninit_data.virtual_addr,
            self.uninit_data.in_file_addr,
            self.uninit_data.size,
        ];
        let mut raw = [0u8; NOFF_HEADER_SIZE];
        for (i, word) in words.iter().enumerate() {
            raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        raw
    }

    /// Bytes the program image occupies in memory, stack excluded.
    pub fn image_size(&self) -> usize {
        self.code.size as usize + self.init_data.size as usize + self.uninit_data.size as usize
    }

    /// Segments whose bytes come from the file.
    pub fn loadable_segments(&self) -> [Segment; 2] {
        [self.code, self.init_data]
    }

    fn swap(&mut self) {
        self.magic = self.magic.swap_bytes();
        self.code.swap();
        self.init_data.swap();
        self.uninit_data.swap();
    }
}
