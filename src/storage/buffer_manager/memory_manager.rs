//! Allocator for large temporary buffers (sorting, hash tables, overflow
//! scratch space), backed by buffer manager frames rather than the heap so
//! that intermediate memory counts against the same budget as cached pages.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::PageIdx;
use crate::error::Result;
use crate::storage::buffer_manager::buffer_manager::{BufferManager, PageReadPolicy};
use crate::storage::buffer_manager::file_handle::{BmFileHandle, FileFlags};
use crate::storage::buffer_manager::vm_region::PageSizeClass;

/// Hands out 256 KiB buffers pinned in the large-page region. Freed buffers
/// return their page index to a free list for reuse.
pub struct MemoryManager {
    bm: Arc<BufferManager>,
    fh: Arc<BmFileHandle>,
    free_pages: Mutex<Vec<PageIdx>>,
}

impl MemoryManager {
    pub fn new(bm: Arc<BufferManager>) -> Result<Self> {
        let fh = bm.create_file_handle(
            Path::new("mm-256kb-temp"),
            FileFlags::in_mem_temp(PageSizeClass::Page256Kb),
        )?;
        Ok(Self {
            bm,
            fh,
            free_pages: Mutex::new(Vec::new()),
        })
    }

    /// Allocates one 256 KiB buffer. Fails with `BufferManagerOom` when the
    /// pool cannot make room for a large page.
    pub fn allocate_buffer(&self, initialize_to_zero: bool) -> Result<MemoryBuffer<'_>> {
        let page_idx = match self.free_pages.lock().pop() {
            Some(idx) => idx,
            None => self.fh.add_new_page()?,
        };
        let data = match self.bm.pin_raw(&self.fh, page_idx, PageReadPolicy::DontReadPage) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.free_pages.lock().push(page_idx);
                return Err(e);
            }
        };
        let len = self.fh.page_size() as usize;
        if initialize_to_zero {
            unsafe { std::ptr::write_bytes(data, 0, len) };
        }
        Ok(MemoryBuffer {
            mm: self,
            page_idx,
            data,
            len,
        })
    }

    pub fn buffer_size(&self) -> u64 {
        self.fh.page_size()
    }

    fn free(&self, page_idx: PageIdx) {
        self.bm.unpin(&self.fh, page_idx);
        self.free_pages.lock().push(page_idx);
    }
}

/// A 256 KiB buffer, exclusively owned until dropped.
pub struct MemoryBuffer<'a> {
    mm: &'a MemoryManager,
    page_idx: PageIdx,
    data: *mut u8,
    len: usize,
}

impl std::ops::Deref for MemoryBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl std::ops::DerefMut for MemoryBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }
}

impl Drop for MemoryBuffer<'_> {
    fn drop(&mut self) {
        self.mm.free(self.page_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::constants::BufferPoolConstants;

    #[test]
    fn allocate_write_free_reuse() -> Result<()> {
        let bm = Arc::new(BufferManager::new(
            BufferPoolConstants::DEFAULT_BUFFER_POOL_SIZE_FOR_TESTING,
        )?);
        let mm = MemoryManager::new(bm)?;
        let first_page;
        {
            let mut buf = mm.allocate_buffer(true)?;
            assert_eq!(buf.len(), BufferPoolConstants::PAGE_256KB_SIZE as usize);
            assert!(buf.iter().all(|&b| b == 0));
            buf[0] = 0xaa;
            first_page = buf.page_idx;
        }
        // The freed page is recycled for the next allocation.
        let buf = mm.allocate_buffer(false)?;
        assert_eq!(buf.page_idx, first_page);
        Ok(())
    }

    #[test]
    fn allocation_respects_the_pool_budget() -> Result<()> {
        let bm = Arc::new(BufferManager::new(BufferPoolConstants::PAGE_256KB_SIZE)?);
        let mm = MemoryManager::new(bm)?;
        let held = mm.allocate_buffer(false)?;
        assert!(mm.allocate_buffer(false).is_err());
        drop(held);
        assert!(mm.allocate_buffer(false).is_ok());
        Ok(())
    }
}
