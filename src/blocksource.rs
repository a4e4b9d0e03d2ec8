// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Result;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// A contiguous segment of bytes handed out by a [`BlockSource`].
///
/// Cheap to clone; the backing allocation is shared and released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct BlockData {
    data: Arc<dyn AsRef<[u8]> + Send + Sync>,
    start: usize,
    end: usize,
}

impl BlockData {
    pub(crate) fn slice_of(
        data: Arc<dyn AsRef<[u8]> + Send + Sync>,
        start: usize,
        end: usize,
    ) -> Self {
        debug_assert!(start <= end && end <= (*data).as_ref().len());
        Self { data, start, end }
    }
}

impl From<Vec<u8>> for BlockData {
    fn from(value: Vec<u8>) -> Self {
        let end = value.len();
        Self {
            data: Arc::new(value),
            start: 0,
            end,
        }
    }
}

impl std::ops::Deref for BlockData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &(*self.data).as_ref()[self.start..self.end]
    }
}

impl std::fmt::Debug for BlockData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockData({} bytes)", self.len())
    }
}

/// Abstracts random reads over a file or memory region.
///
/// A read must satisfy the full length, except at the end of the source where
/// it is shortened. Returned blocks stay valid for as long as the caller
/// holds them, independently of the source being dropped.
pub trait BlockSource: Send + Sync {
    /// Size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads `size` bytes starting at `offset`, shortened at EOF.
    fn read_block(&self, offset: u64, size: u32) -> Result<BlockData>;
}

/// In-memory block source; reads are zero-copy slices.
pub struct MemorySource {
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }
}

impl BlockSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_block(&self, offset: u64, size: u32) -> Result<BlockData> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + size as usize).min(self.data.len());
        Ok(BlockData::slice_of(self.data.clone(), start, end))
    }
}

/// File-backed block source using positioned reads.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Opens a table file.
    ///
    /// An absent file surfaces as [`crate::Error::NotExist`], which the stack
    /// needs to tell apart from real I/O failures during reloads.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }
}

impl BlockSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_block(&self, offset: u64, size: u32) -> Result<BlockData> {
        let offset = offset.min(self.size);
        let want = (size as u64).min(self.size - offset) as usize;

        let mut buf = vec![0; want];
        let mut filled = 0;

        // read_at may return short counts even mid-file
        while filled < want {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read of {want} bytes at {offset}"),
                )
                .into());
            }
            filled += n;
        }

        Ok(buf.into())
    }
}

/// Memory-mapped block source; reads are zero-copy slices of the mapping.
#[cfg(feature = "mmap")]
pub struct MmapSource {
    map: Arc<memmap2::Mmap>,
}

#[cfg(feature = "mmap")]
impl MmapSource {
    /// Maps a table file into memory.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        // SAFETY: table files are immutable once renamed into place, so the
        // mapping cannot observe concurrent modification
        let map = unsafe { memmap2::Mmap::map(&file)? };

        Ok(Self { map: Arc::new(map) })
    }
}

#[cfg(feature = "mmap")]
impl BlockSource for MmapSource {
    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_block(&self, offset: u64, size: u32) -> Result<BlockData> {
        let start = (offset as usize).min(self.map.len());
        let end = (start + size as usize).min(self.map.len());
        Ok(BlockData::slice_of(self.map.clone(), start, end))
    }
}
