//! Named shared memory segment structures and operations.
//!
//! A segment is a file under `/dev/shm` holding a fixed 64-byte header
//! followed by the payload area. The coordinator creates and destroys
//! segments; modules attach to them by name for zero-copy topic payloads.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};

use memmap2::{MmapMut, MmapOptions};
use static_assertions::const_assert_eq;

use crate::error::{ShmError, ShmResult};

/// Magic number identifying a simco segment.
pub const SHM_MAGIC: u64 = 0x5349_4d43_4f31_0000; // "SIMCO1"

/// Page granularity segments are rounded up to.
pub const SHM_PAGE_SIZE: usize = 4096;

/// Segment header, cache-line sized and aligned.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number for validation.
    pub magic: u64,
    /// Payload size in bytes.
    pub data_size: u64,
    /// Creating process id.
    pub creator_pid: u32,
    _padding: [u8; 44],
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), 64);
const_assert_eq!(core::mem::align_of::<SegmentHeader>(), 64);

impl SegmentHeader {
    fn new(data_size: usize) -> Self {
        Self {
            magic: SHM_MAGIC,
            data_size: data_size as u64,
            creator_pid: nix::unistd::getpid().as_raw() as u32,
            _padding: [0; 44],
        }
    }

    /// Validate header magic.
    pub fn validate(&self) -> bool {
        self.magic == SHM_MAGIC
    }
}

/// One named shared memory segment.
pub struct ShmSegment {
    name: String,
    path: PathBuf,
    data_size: usize,
    mmap: MmapMut,
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("data_size", &self.data_size)
            .finish()
    }
}

fn segment_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(name)
}

impl ShmSegment {
    /// Create a new segment. Fails if a segment of the same name exists.
    pub fn create(name: &str, data_size: usize) -> ShmResult<Self> {
        if data_size == 0 {
            return Err(ShmError::InvalidSize { size: data_size });
        }
        let path = segment_path(name);
        if path.exists() {
            return Err(ShmError::AlreadyExists { name: name.to_string() });
        }

        let header_size = core::mem::size_of::<SegmentHeader>();
        let total_size = (data_size + header_size).div_ceil(SHM_PAGE_SIZE) * SHM_PAGE_SIZE;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)?;
        file.set_len(total_size as u64)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        {
            let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut SegmentHeader) };
            *header = SegmentHeader::new(data_size);
        }
        // Header must be visible before the name is handed out.
        fence(Ordering::Release);

        Ok(Self { name: name.to_string(), path, data_size, mmap })
    }

    /// Attach to an existing segment and validate its header.
    pub fn attach(name: &str) -> ShmResult<Self> {
        let path = segment_path(name);
        if !path.exists() {
            return Err(ShmError::NotFound { name: name.to_string() });
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        if mmap.len() < core::mem::size_of::<SegmentHeader>() {
            return Err(ShmError::InvalidHeader { name: name.to_string() });
        }
        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };
        if !header.validate() {
            return Err(ShmError::InvalidHeader { name: name.to_string() });
        }
        let data_size = header.data_size as usize;
        Ok(Self { name: name.to_string(), path, data_size, mmap })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Header view.
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// Payload area.
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.mmap.as_ptr().add(core::mem::size_of::<SegmentHeader>()),
                self.data_size,
            )
        }
    }

    /// Mutable payload area (writer only).
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.mmap.as_mut_ptr().add(core::mem::size_of::<SegmentHeader>()),
                self.data_size,
            )
        }
    }

    /// Remove the segment from the OS, consuming the handle.
    pub fn destroy(self) -> ShmResult<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Remove a segment by name without attaching first.
    pub fn unlink(name: &str) -> ShmResult<()> {
        let path = segment_path(name);
        if !path.exists() {
            return Err(ShmError::NotFound { name: name.to_string() });
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
