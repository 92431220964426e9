use std::fs::OpenOptions;
use std::io;
use std::ops::Range;
use std::path::Path;

use memmap2::MmapMut;

/// Backing memory for a bucket region: plain byte access plus a durable
/// write primitive. Stores keep the length they were created with.
pub trait ByteStore: AsRef<[u8]> + AsMut<[u8]> {
    /// Makes `range` durable. A mutation is not guaranteed to survive a
    /// crash until this has returned for every range it touched.
    fn persist(&mut self, range: Range<usize>) -> io::Result<()>;
}

impl ByteStore for Vec<u8> {
    fn persist(&mut self, _range: Range<usize>) -> io::Result<()> {
        // memory only, nothing to do
        Ok(())
    }
}

pub struct MMapFile {
    mmap: MmapMut,
}

impl MMapFile {
    /// Creates `path` as a zero-filled file of exactly `len` bytes and maps
    /// it writable. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(len as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap })
    }

    /// Maps an existing file writable at its current length.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap })
    }
}

impl AsRef<[u8]> for MMapFile {
    fn as_ref(&self) -> &[u8] {
        &self.mmap
    }
}

impl AsMut<[u8]> for MMapFile {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl ByteStore for MMapFile {
    fn persist(&mut self, range: Range<usize>) -> io::Result<()> {
        self.mmap.flush_range(range.start, range.len())
    }
}
