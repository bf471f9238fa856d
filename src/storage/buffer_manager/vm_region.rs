//! Anonymous virtual-memory regions backing buffer manager frames.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::constants::StorageConstants;
use crate::common::types::{FrameGroupIdx, FrameIdx};
use crate::error::{DbError, Result};

/// The two page sizes the engine works with. Small pages hold persistent
/// data; large pages hold temporary in-memory buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageSizeClass {
    Page4Kb = 0,
    Page256Kb = 1,
}

impl PageSizeClass {
    pub fn page_size(self) -> u64 {
        use crate::common::constants::BufferPoolConstants;
        match self {
            PageSizeClass::Page4Kb => BufferPoolConstants::PAGE_4KB_SIZE,
            PageSizeClass::Page256Kb => BufferPoolConstants::PAGE_256KB_SIZE,
        }
    }
}

/// One large anonymous mapping per page-size class, carved into frames at
/// fixed offsets. Committing virtual address space up front gives every
/// (file, page) pair a stable frame address; physical memory is only
/// consumed once a frame is written, and is handed back to the OS on
/// eviction via `madvise(MADV_DONTNEED)`.
///
/// Frames are handed out in groups of 1024, one group per file page group.
pub struct VmRegion {
    base: *mut u8,
    region_size: u64,
    page_size: u64,
    num_frame_groups: AtomicU32,
    max_num_frame_groups: u32,
}

// The region is a plain byte range; synchronization of frame contents is the
// buffer manager's job (page state words).
unsafe impl Send for VmRegion {}
unsafe impl Sync for VmRegion {}

impl VmRegion {
    pub fn new(page_size_class: PageSizeClass, max_region_size: u64) -> Result<Self> {
        let page_size = page_size_class.page_size();
        let frame_group_size = page_size << StorageConstants::PAGE_GROUP_SIZE_LOG2;
        let max_num_frame_groups = max_region_size.div_ceil(frame_group_size).max(1);
        let region_size = max_num_frame_groups * frame_group_size;
        let base = Self::map_region(region_size)?;
        Ok(Self {
            base,
            region_size,
            page_size,
            num_frame_groups: AtomicU32::new(0),
            max_num_frame_groups: u32::try_from(max_num_frame_groups)
                .map_err(|_| DbError::Config("virtual memory region too large".to_string()))?,
        })
    }

    #[cfg(unix)]
    fn map_region(region_size: u64) -> Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                region_size as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DbError::Io(std::io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    #[cfg(not(unix))]
    fn map_region(region_size: u64) -> Result<*mut u8> {
        // No overcommitted anonymous mappings here; fall back to a zeroed
        // heap region sized to the maximum. Only suitable for small regions.
        let layout = std::alloc::Layout::from_size_align(region_size as usize, 4096)
            .map_err(|e| DbError::Config(e.to_string()))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DbError::BufferManagerOom(
                "failed to allocate virtual memory region".to_string(),
            ));
        }
        Ok(ptr)
    }

    /// Reserves the next frame group. Pure counter bump; the address space
    /// already exists.
    pub fn add_new_frame_group(&self) -> Result<FrameGroupIdx> {
        let group_idx = self.num_frame_groups.fetch_add(1, Ordering::SeqCst);
        if group_idx >= self.max_num_frame_groups {
            self.num_frame_groups.fetch_sub(1, Ordering::SeqCst);
            return Err(DbError::BufferManagerOom(format!(
                "virtual memory region exhausted after {} frame groups",
                self.max_num_frame_groups
            )));
        }
        Ok(group_idx)
    }

    pub fn get_frame(&self, frame_idx: FrameIdx) -> *mut u8 {
        debug_assert!((frame_idx as u64) < self.region_size / self.page_size);
        unsafe { self.base.add(frame_idx as usize * self.page_size as usize) }
    }

    /// Tells the OS it may drop the physical pages under this frame. The
    /// virtual mapping stays; the next access reads zeroes.
    pub fn release_frame(&self, frame_idx: FrameIdx) {
        let frame = self.get_frame(frame_idx);
        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(
                frame as *mut libc::c_void,
                self.page_size as libc::size_t,
                libc::MADV_DONTNEED,
            );
        }
        #[cfg(all(unix, not(target_os = "linux")))]
        unsafe {
            // MADV_DONTNEED is not reliably destructive for private
            // mappings everywhere; zero the frame so the next load starts
            // from a clean slate either way.
            libc::madvise(
                frame as *mut libc::c_void,
                self.page_size as libc::size_t,
                libc::MADV_DONTNEED,
            );
            std::ptr::write_bytes(frame, 0, self.page_size as usize);
        }
        #[cfg(not(unix))]
        unsafe {
            std::ptr::write_bytes(frame, 0, self.page_size as usize);
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.region_size as libc::size_t);
        }
        #[cfg(not(unix))]
        unsafe {
            let layout =
                std::alloc::Layout::from_size_align_unchecked(self.region_size as usize, 4096);
            std::alloc::dealloc(self.base, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_distinct_and_writable() -> Result<()> {
        let region = VmRegion::new(PageSizeClass::Page4Kb, 1 << 24)?;
        region.add_new_frame_group()?;
        let f0 = region.get_frame(0);
        let f1 = region.get_frame(1);
        assert_eq!(f1 as usize - f0 as usize, 4096);
        unsafe {
            *f0 = 0xab;
            *f1 = 0xcd;
            assert_eq!(*f0, 0xab);
        }
        Ok(())
    }

    #[test]
    fn released_frame_reads_zero() -> Result<()> {
        let region = VmRegion::new(PageSizeClass::Page4Kb, 1 << 24)?;
        region.add_new_frame_group()?;
        let frame = region.get_frame(3);
        unsafe { *frame = 0x42 };
        region.release_frame(3);
        assert_eq!(unsafe { *frame }, 0);
        Ok(())
    }

    #[test]
    fn frame_groups_are_bounded() -> Result<()> {
        // Room for exactly one 4 KiB frame group (4 MiB).
        let region = VmRegion::new(PageSizeClass::Page4Kb, 1 << 22)?;
        assert!(region.add_new_frame_group().is_ok());
        assert!(region.add_new_frame_group().is_err());
        Ok(())
    }
}
