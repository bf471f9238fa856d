//! Per-file state: page counts, page state words, frame mapping, and WAL
//! shadow-page redirects.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::common::constants::StorageConstants;
use crate::common::types::{FrameIdx, PageGroupIdx, PageIdx, INVALID_PAGE_IDX};
use crate::common::ConcurrentVector;
use crate::common::FileInfo;
use crate::error::{DbError, Result};
use crate::storage::buffer_manager::page_state::PageState;
use crate::storage::buffer_manager::vm_region::{PageSizeClass, VmRegion};

/// How a file handle is opened.
#[derive(Debug, Clone, Copy)]
pub struct FileFlags {
    pub page_size_class: PageSizeClass,
    pub read_only: bool,
    pub in_mem_temp: bool,
    pub create_if_not_exists: bool,
}

impl FileFlags {
    pub fn persistent_no_create() -> Self {
        Self {
            page_size_class: PageSizeClass::Page4Kb,
            read_only: false,
            in_mem_temp: false,
            create_if_not_exists: false,
        }
    }

    pub fn persistent_create_if_not_exists() -> Self {
        Self {
            create_if_not_exists: true,
            ..Self::persistent_no_create()
        }
    }

    pub fn persistent_read_only() -> Self {
        Self {
            read_only: true,
            ..Self::persistent_no_create()
        }
    }

    /// Temporary file with no disk backing; pages live only in frames.
    pub fn in_mem_temp(page_size_class: PageSizeClass) -> Self {
        Self {
            page_size_class,
            read_only: false,
            in_mem_temp: true,
            create_if_not_exists: false,
        }
    }
}

/// WAL shadow-page redirects for one group of 1024 file pages. Each entry
/// pairs a mutex (held while a writer materializes or consults the shadow)
/// with the shadow's page index in the WAL file, `INVALID_PAGE_IDX` if none.
struct WalPageIdxEntry {
    mtx: Arc<Mutex<()>>,
    wal_page_idx: AtomicU32,
}

impl Default for WalPageIdxEntry {
    fn default() -> Self {
        Self {
            mtx: Arc::new(Mutex::new(())),
            wal_page_idx: AtomicU32::new(INVALID_PAGE_IDX),
        }
    }
}

struct WalPageIdxGroup {
    entries: Vec<WalPageIdxEntry>,
}

impl WalPageIdxGroup {
    fn new() -> Self {
        Self {
            entries: (0..StorageConstants::PAGE_GROUP_SIZE)
                .map(|_| WalPageIdxEntry::default())
                .collect(),
        }
    }
}

/// Guard for one base page's WAL-redirect entry. Dropping it releases the
/// per-page redirect lock on every exit path.
pub struct WalPageIdxLockGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

/// The in-memory representation of one database file, registered with the
/// buffer manager. Holds the open file, the logical page count, one
/// [`PageState`] per page, and the mapping from page groups to frame groups
/// in the buffer manager's virtual memory region.
///
/// Structural changes (adding and truncating pages) serialize on the file
/// handle's mutex; per-page reads and writes go through the page states and
/// need no file-level lock.
pub struct BmFileHandle {
    file_info: FileInfo,
    flags: FileFlags,
    vm_region: Arc<VmRegion>,
    num_pages: AtomicU32,
    page_capacity: AtomicU32,
    page_states: ConcurrentVector<PageState>,
    frame_group_idxs: ConcurrentVector<AtomicU32>,
    wal_page_groups: DashMap<PageGroupIdx, WalPageIdxGroup>,
    fh_mutex: RwLock<()>,
}

impl BmFileHandle {
    pub(crate) fn new(path: &Path, flags: FileFlags, vm_region: Arc<VmRegion>) -> Result<Self> {
        let file_info = if flags.in_mem_temp {
            FileInfo::new_in_mem(path)
        } else {
            FileInfo::open(path, flags.create_if_not_exists, flags.read_only)?
        };
        let num_pages = if flags.in_mem_temp {
            0
        } else {
            file_info.size()?.div_ceil(flags.page_size_class.page_size()) as u32
        };
        let handle = Self {
            file_info,
            flags,
            vm_region,
            num_pages: AtomicU32::new(num_pages),
            page_capacity: AtomicU32::new(0),
            page_states: ConcurrentVector::new(),
            frame_group_idxs: ConcurrentVector::new(),
            wal_page_groups: DashMap::new(),
            fh_mutex: RwLock::new(()),
        };
        while handle.page_capacity.load(Ordering::SeqCst) < num_pages {
            handle.add_new_page_group()?;
        }
        Ok(handle)
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::SeqCst)
    }

    pub fn page_size(&self) -> u64 {
        self.flags.page_size_class.page_size()
    }

    pub fn page_size_class(&self) -> PageSizeClass {
        self.flags.page_size_class
    }

    pub fn is_in_mem_temp(&self) -> bool {
        self.flags.in_mem_temp
    }

    pub(crate) fn vm_region(&self) -> &VmRegion {
        &self.vm_region
    }

    /// Grows the file by one page and returns its index.
    pub fn add_new_page(&self) -> Result<PageIdx> {
        let _xlock = self.fh_mutex.write();
        self.add_new_page_without_lock()
    }

    fn add_new_page_without_lock(&self) -> Result<PageIdx> {
        let page_idx = self.num_pages.load(Ordering::SeqCst);
        if page_idx >= self.page_capacity.load(Ordering::SeqCst) {
            self.add_new_page_group()?;
        }
        // The slot may hold a stale word from a page truncated earlier.
        self.page_states.get(page_idx as usize).reset_to_evicted();
        self.num_pages.store(page_idx + 1, Ordering::SeqCst);
        Ok(page_idx)
    }

    fn add_new_page_group(&self) -> Result<()> {
        let capacity = self.page_capacity.load(Ordering::SeqCst);
        let new_capacity = capacity + StorageConstants::PAGE_GROUP_SIZE as u32;
        self.page_states.resize(new_capacity as usize);
        let group_idx = (capacity >> StorageConstants::PAGE_GROUP_SIZE_LOG2) as usize;
        self.frame_group_idxs.resize(group_idx + 1);
        let frame_group_idx = self.vm_region.add_new_frame_group()?;
        self.frame_group_idxs
            .get(group_idx)
            .store(frame_group_idx, Ordering::SeqCst);
        self.page_capacity.store(new_capacity, Ordering::SeqCst);
        Ok(())
    }

    /// Shrinks the logical page count to `first_page_idx_to_remove`. Frame
    /// groups and WAL page groups past the new count are dropped; bytes
    /// already on disk are left for the caller to truncate.
    ///
    /// The caller must first make sure the buffer manager holds no frames
    /// for the removed pages.
    pub fn remove_page_idxs_and_truncate_if_necessary(&self, first_page_idx_to_remove: PageIdx) {
        let _xlock = self.fh_mutex.write();
        let num_pages = self.num_pages.load(Ordering::SeqCst);
        if first_page_idx_to_remove >= num_pages {
            return;
        }
        for page_idx in first_page_idx_to_remove..num_pages {
            self.page_states.get(page_idx as usize).reset_to_evicted();
        }
        self.num_pages
            .store(first_page_idx_to_remove, Ordering::SeqCst);
        let groups_needed =
            (first_page_idx_to_remove as u64).div_ceil(StorageConstants::PAGE_GROUP_SIZE) as u32;
        let new_capacity = groups_needed << StorageConstants::PAGE_GROUP_SIZE_LOG2;
        self.page_capacity.store(new_capacity, Ordering::SeqCst);
        self.page_states.truncate(new_capacity as usize);
        self.frame_group_idxs.truncate(groups_needed as usize);
        self.wal_page_groups
            .retain(|group_idx, _| *group_idx < groups_needed);
    }

    /// Drops every page and all bookkeeping, and truncates the backing file
    /// to zero bytes. The buffer manager must not hold any of the file's
    /// pages when this is called.
    pub fn reset_to_zero_pages_and_page_capacity(&self) -> Result<()> {
        let _xlock = self.fh_mutex.write();
        self.num_pages.store(0, Ordering::SeqCst);
        self.page_capacity.store(0, Ordering::SeqCst);
        self.page_states.truncate(0);
        self.frame_group_idxs.truncate(0);
        self.wal_page_groups.clear();
        if !self.flags.in_mem_temp {
            self.file_info.truncate(0)?;
        }
        Ok(())
    }

    pub fn read_page(&self, frame: &mut [u8], page_idx: PageIdx) -> Result<()> {
        self.file_info
            .read_from_file(frame, page_idx as u64 * self.page_size())
    }

    pub fn write_page(&self, buffer: &[u8], page_idx: PageIdx) -> Result<()> {
        self.file_info
            .write_to_file(buffer, page_idx as u64 * self.page_size())
    }

    /// Stable for the lifetime of the handle; eviction candidates rely on
    /// this (the page-state vector only ever appends chunks).
    pub(crate) fn page_state(&self, page_idx: PageIdx) -> &PageState {
        self.page_states.get(page_idx as usize)
    }

    /// Bounds-checked variant for eviction candidates that may outlive a
    /// truncation.
    pub(crate) fn page_state_checked(&self, page_idx: PageIdx) -> Option<&PageState> {
        if (page_idx as usize) < self.page_states.len() {
            Some(self.page_states.get(page_idx as usize))
        } else {
            None
        }
    }

    pub(crate) fn frame_idx(&self, page_idx: PageIdx) -> FrameIdx {
        let group = (page_idx >> StorageConstants::PAGE_GROUP_SIZE_LOG2) as usize;
        let frame_group_idx = self.frame_group_idxs.get(group).load(Ordering::SeqCst);
        (frame_group_idx << StorageConstants::PAGE_GROUP_SIZE_LOG2)
            | (page_idx & StorageConstants::PAGE_IDX_IN_GROUP_MASK as u32)
    }

    /// Marks a page the caller holds pinned (LOCKED) as dirty. Used on
    /// write paths that already own the page exclusively; everyone else
    /// goes through `BufferManager::set_pinned_page_dirty`.
    pub fn set_locked_page_dirty(&self, page_idx: PageIdx) {
        self.page_state(page_idx).set_dirty();
    }

    // WAL shadow-page redirects.

    fn wal_group_idx(page_idx: PageIdx) -> PageGroupIdx {
        page_idx >> StorageConstants::PAGE_GROUP_SIZE_LOG2
    }

    fn wal_pos_in_group(page_idx: PageIdx) -> usize {
        (page_idx & StorageConstants::PAGE_IDX_IN_GROUP_MASK as u32) as usize
    }

    /// Lazily creates the redirect group covering `page_idx`.
    pub fn add_wal_page_idx_group_if_necessary(&self, page_idx: PageIdx) {
        self.wal_page_groups
            .entry(Self::wal_group_idx(page_idx))
            .or_insert_with(WalPageIdxGroup::new);
    }

    /// Locks the redirect entry for `page_idx`. The group must exist.
    pub fn acquire_wal_page_idx_lock(&self, page_idx: PageIdx) -> WalPageIdxLockGuard {
        let mtx = {
            let group = self
                .wal_page_groups
                .get(&Self::wal_group_idx(page_idx))
                .expect("WAL page idx group must exist before locking");
            Arc::clone(&group.entries[Self::wal_pos_in_group(page_idx)].mtx)
        };
        WalPageIdxLockGuard {
            _guard: mtx.lock_arc(),
        }
    }

    /// Reads the redirect without taking the entry lock. Callers on write
    /// paths must hold the entry lock; read-transaction paths tolerate the
    /// race (they only ever see fully published redirects).
    pub fn get_wal_page_idx_no_lock(&self, page_idx: PageIdx) -> Option<PageIdx> {
        let group = self.wal_page_groups.get(&Self::wal_group_idx(page_idx))?;
        let wal_idx = group.entries[Self::wal_pos_in_group(page_idx)]
            .wal_page_idx
            .load(Ordering::SeqCst);
        (wal_idx != INVALID_PAGE_IDX).then_some(wal_idx)
    }

    pub fn has_wal_page_idx_no_lock(&self, page_idx: PageIdx) -> bool {
        self.get_wal_page_idx_no_lock(page_idx).is_some()
    }

    /// Publishes the shadow mapping. The caller must hold the entry lock.
    pub fn set_wal_page_idx_no_lock(&self, original_page_idx: PageIdx, page_idx_in_wal: PageIdx) {
        let group = self
            .wal_page_groups
            .get(&Self::wal_group_idx(original_page_idx))
            .expect("WAL page idx group must exist before setting");
        group.entries[Self::wal_pos_in_group(original_page_idx)]
            .wal_page_idx
            .store(page_idx_in_wal, Ordering::SeqCst);
    }

    /// Publishes the shadow mapping, taking the entry lock itself.
    pub fn set_wal_page_idx(&self, original_page_idx: PageIdx, page_idx_in_wal: PageIdx) {
        let _lock = self.acquire_wal_page_idx_lock(original_page_idx);
        self.set_wal_page_idx_no_lock(original_page_idx, page_idx_in_wal);
    }

    /// Drops the redirect for one page, if any.
    pub fn clear_wal_page_idx_if_necessary(&self, page_idx: PageIdx) {
        if let Some(group) = self.wal_page_groups.get(&Self::wal_group_idx(page_idx)) {
            let entry = &group.entries[Self::wal_pos_in_group(page_idx)];
            let _lock = entry.mtx.lock();
            entry.wal_page_idx.store(INVALID_PAGE_IDX, Ordering::SeqCst);
        }
    }

    /// Drops every redirect (end of a transaction).
    pub fn clear_all_wal_page_idxs(&self) {
        self.wal_page_groups.clear();
    }

    pub(crate) fn verify_page_idx(&self, page_idx: PageIdx) -> Result<()> {
        if page_idx >= self.num_pages() {
            return Err(DbError::InvalidArgument(format!(
                "page index {} out of range for file {} with {} pages",
                page_idx,
                self.file_info.path().display(),
                self.num_pages()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::constants::BufferPoolConstants;
    use tempfile::tempdir;

    fn test_region() -> Arc<VmRegion> {
        Arc::new(VmRegion::new(PageSizeClass::Page4Kb, 1 << 30).unwrap())
    }

    #[test]
    fn add_pages_and_frame_idx_math() -> Result<()> {
        let dir = tempdir().unwrap();
        let fh = BmFileHandle::new(
            &dir.path().join("t.col"),
            FileFlags::persistent_create_if_not_exists(),
            test_region(),
        )?;
        assert_eq!(fh.num_pages(), 0);
        for expected in 0..3 {
            assert_eq!(fh.add_new_page()?, expected);
        }
        assert_eq!(fh.num_pages(), 3);
        // Pages of the first group map into the file's first frame group.
        let base = fh.frame_idx(0);
        assert_eq!(fh.frame_idx(2), base + 2);
        Ok(())
    }

    #[test]
    fn growth_across_a_page_group_boundary() -> Result<()> {
        let dir = tempdir().unwrap();
        let fh = BmFileHandle::new(
            &dir.path().join("t.col"),
            FileFlags::persistent_create_if_not_exists(),
            test_region(),
        )?;
        for _ in 0..=StorageConstants::PAGE_GROUP_SIZE {
            fh.add_new_page()?;
        }
        assert_eq!(fh.num_pages() as u64, StorageConstants::PAGE_GROUP_SIZE + 1);
        let in_first_group = fh.frame_idx(0);
        let in_second_group = fh.frame_idx(StorageConstants::PAGE_GROUP_SIZE as u32);
        assert_ne!(
            in_first_group >> StorageConstants::PAGE_GROUP_SIZE_LOG2,
            in_second_group >> StorageConstants::PAGE_GROUP_SIZE_LOG2
        );
        Ok(())
    }

    #[test]
    fn opens_existing_file_with_page_count() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.col");
        {
            let fh = BmFileHandle::new(
                &path,
                FileFlags::persistent_create_if_not_exists(),
                test_region(),
            )?;
            fh.add_new_page()?;
            fh.add_new_page()?;
            fh.write_page(&[7u8; BufferPoolConstants::PAGE_4KB_SIZE as usize], 1)?;
        }
        let fh = BmFileHandle::new(&path, FileFlags::persistent_no_create(), test_region())?;
        assert_eq!(fh.num_pages(), 2);
        Ok(())
    }

    #[test]
    fn truncate_then_regrow_resets_state() -> Result<()> {
        let dir = tempdir().unwrap();
        let fh = BmFileHandle::new(
            &dir.path().join("t.col"),
            FileFlags::persistent_create_if_not_exists(),
            test_region(),
        )?;
        for _ in 0..4 {
            fh.add_new_page()?;
        }
        fh.remove_page_idxs_and_truncate_if_necessary(1);
        assert_eq!(fh.num_pages(), 1);
        let page_idx = fh.add_new_page()?;
        assert_eq!(page_idx, 1);
        assert_eq!(
            PageState::state_of(fh.page_state(1).load()),
            PageState::EVICTED
        );
        Ok(())
    }

    #[test]
    fn wal_redirects_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let fh = BmFileHandle::new(
            &dir.path().join("t.col"),
            FileFlags::persistent_create_if_not_exists(),
            test_region(),
        )?;
        fh.add_new_page()?;
        assert!(!fh.has_wal_page_idx_no_lock(0));
        fh.add_wal_page_idx_group_if_necessary(0);
        {
            let _lock = fh.acquire_wal_page_idx_lock(0);
            fh.set_wal_page_idx_no_lock(0, 17);
        }
        assert_eq!(fh.get_wal_page_idx_no_lock(0), Some(17));
        fh.clear_wal_page_idx_if_necessary(0);
        assert!(!fh.has_wal_page_idx_no_lock(0));
        Ok(())
    }
}
