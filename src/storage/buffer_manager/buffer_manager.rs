//! The buffer manager: a process-wide page cache over virtually-mapped
//! frames, with a queue-based eviction policy.
//!
//! Every database file is registered as a [`BmFileHandle`]; each of its
//! pages maps to a unique frame in the [`VmRegion`] of the file's page-size
//! class. Pinning a page loads it into its frame (evicting others if the
//! memory budget is exhausted) and holds it exclusively until unpinned;
//! read-only paths that want to avoid the pin round trip use
//! [`optimistic_read`](BufferManager::pin) and revalidate against the page's
//! version counter.
//!
//! The design follows vmcache-style virtual-memory assisted buffering: one
//! state word per page carries the lock, a version counter, and the dirty
//! flag; eviction is a second-chance clock over an MPMC queue of recently
//! unpinned pages.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use tracing::{debug, warn};

use crate::common::constants::BufferPoolConstants;
use crate::common::types::{PageIdx, INVALID_PAGE_IDX};
use crate::error::{DbError, Result};
use crate::storage::buffer_manager::file_handle::{BmFileHandle, FileFlags};
use crate::storage::buffer_manager::page_state::PageState;
use crate::storage::buffer_manager::vm_region::{PageSizeClass, VmRegion};

/// Whether `pin` must load the page's bytes from disk. `DontReadPage` is for
/// pages about to be fully overwritten (new pages, WAL shadow targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageReadPolicy {
    ReadPage,
    DontReadPage,
}

/// A recently unpinned page. The expected version makes candidates
/// self-invalidating: any pin/unpin after enqueueing bumps the page's
/// version and the candidate goes stale. The weak handle keeps closed files
/// from being resurrected by their leftover candidates.
struct EvictionCandidate {
    file_handle: Weak<BmFileHandle>,
    page_idx: PageIdx,
    version: u64,
}

struct EvictionQueue {
    queue: SegQueue<EvictionCandidate>,
    num_insertions: AtomicU64,
}

impl EvictionQueue {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            num_insertions: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, candidate: EvictionCandidate) {
        self.queue.push(candidate);
    }

    fn dequeue(&self) -> Option<EvictionCandidate> {
        self.queue.pop()
    }

    /// Pops stale candidates until one that still looks evictable is seen,
    /// then puts it back. Keeps the queue from filling up with entries for
    /// pages that were re-pinned after being enqueued.
    fn remove_non_evictable_candidates(&self) {
        while let Some(candidate) = self.queue.pop() {
            if candidate.is_plausibly_evictable() {
                self.queue.push(candidate);
                break;
            }
        }
    }
}

impl EvictionCandidate {
    fn is_plausibly_evictable(&self) -> bool {
        let Some(fh) = self.file_handle.upgrade() else {
            return false;
        };
        let Some(state) = fh.page_state_checked(self.page_idx) else {
            return false;
        };
        let word = state.load();
        PageState::version_of(word) == self.version
            && matches!(
                PageState::state_of(word),
                PageState::UNLOCKED | PageState::MARKED
            )
    }
}

/// A pinned page. Dereferences to the page's frame bytes; unpins on drop,
/// so the pin is released on every exit path.
pub struct PinnedFrame<'a> {
    bm: &'a BufferManager,
    fh: Arc<BmFileHandle>,
    page_idx: PageIdx,
    frame: *mut u8,
    page_size: usize,
}

impl PinnedFrame<'_> {
    pub fn page_idx(&self) -> PageIdx {
        self.page_idx
    }

    /// Marks the pinned page dirty so eviction and flushes write it back.
    pub fn set_dirty(&self) {
        if !self.frame.is_null() {
            self.fh.set_locked_page_dirty(self.page_idx);
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.frame
    }
}

impl std::ops::Deref for PinnedFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.frame.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.frame, self.page_size) }
    }
}

impl std::ops::DerefMut for PinnedFrame<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        if self.frame.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.frame, self.page_size) }
    }
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.bm.unpin(&self.fh, self.page_idx);
    }
}

/// The centralized manager of database memory. See the module docs.
pub struct BufferManager {
    used_memory: AtomicU64,
    buffer_pool_size: AtomicU64,
    // One region per page-size class, indexed by `PageSizeClass`.
    vm_regions: [Arc<VmRegion>; 2],
    eviction_queue: EvictionQueue,
}

impl BufferManager {
    pub fn new(buffer_pool_size: u64) -> Result<Self> {
        if buffer_pool_size == 0 {
            return Err(DbError::Config(
                "buffer pool size must be non-zero".to_string(),
            ));
        }
        let vm_regions = [
            Arc::new(VmRegion::new(
                PageSizeClass::Page4Kb,
                BufferPoolConstants::DEFAULT_VM_REGION_MAX_SIZE,
            )?),
            Arc::new(VmRegion::new(PageSizeClass::Page256Kb, buffer_pool_size)?),
        ];
        debug!(buffer_pool_size, "buffer manager initialized");
        Ok(Self {
            used_memory: AtomicU64::new(0),
            buffer_pool_size: AtomicU64::new(buffer_pool_size),
            vm_regions,
            eviction_queue: EvictionQueue::new(),
        })
    }

    /// Opens a file and registers it with this buffer manager.
    pub fn create_file_handle(&self, path: &Path, flags: FileFlags) -> Result<Arc<BmFileHandle>> {
        let region = Arc::clone(&self.vm_regions[flags.page_size_class as usize]);
        Ok(Arc::new(BmFileHandle::new(path, flags, region)?))
    }

    pub fn used_memory(&self) -> u64 {
        self.used_memory.load(Ordering::SeqCst)
    }

    pub fn buffer_pool_size(&self) -> u64 {
        self.buffer_pool_size.load(Ordering::SeqCst)
    }

    /// Pins a page, returning a guard over its frame. The frame holds the
    /// page's current bytes, unless `DontReadPage` was passed, in which case
    /// the contents are unspecified and the caller is expected to overwrite
    /// them. The page is held exclusively until the guard drops.
    ///
    /// Pinning `INVALID_PAGE_IDX` yields an empty frame and touches nothing;
    /// callers that encode "no page" this way get a no-op guard back.
    pub fn pin<'a>(
        &'a self,
        fh: &Arc<BmFileHandle>,
        page_idx: PageIdx,
        policy: PageReadPolicy,
    ) -> Result<PinnedFrame<'a>> {
        let frame = self.pin_raw(fh, page_idx, policy)?;
        Ok(PinnedFrame {
            bm: self,
            fh: Arc::clone(fh),
            page_idx,
            frame,
            page_size: fh.page_size() as usize,
        })
    }

    pub(crate) fn pin_raw(
        &self,
        fh: &Arc<BmFileHandle>,
        page_idx: PageIdx,
        policy: PageReadPolicy,
    ) -> Result<*mut u8> {
        if page_idx == INVALID_PAGE_IDX {
            return Ok(std::ptr::null_mut());
        }
        fh.verify_page_idx(page_idx)?;
        let state = fh.page_state(page_idx);
        loop {
            let word = state.load();
            match PageState::state_of(word) {
                PageState::EVICTED => {
                    if state.try_lock(word) {
                        if let Err(e) = self.claim_frame(fh, page_idx, policy) {
                            state.restore_to_evicted();
                            return Err(e);
                        }
                        break;
                    }
                }
                PageState::UNLOCKED | PageState::MARKED => {
                    if state.try_lock(word) {
                        break;
                    }
                }
                _ => std::hint::spin_loop(),
            }
        }
        Ok(self.frame_ptr(fh, page_idx))
    }

    /// Releases a pin. The page becomes an eviction candidate immediately.
    pub fn unpin(&self, fh: &Arc<BmFileHandle>, page_idx: PageIdx) {
        if page_idx == INVALID_PAGE_IDX {
            return;
        }
        let state = fh.page_state(page_idx);
        state.unlock();
        let version = PageState::version_of(state.load());
        self.add_to_eviction_queue(fh, page_idx, version);
    }

    /// Marks a page the caller has pinned as dirty. Fails if the page is not
    /// currently pinned.
    pub fn set_pinned_page_dirty(&self, fh: &Arc<BmFileHandle>, page_idx: PageIdx) -> Result<()> {
        fh.verify_page_idx(page_idx)?;
        let state = fh.page_state(page_idx);
        if PageState::state_of(state.load()) != PageState::LOCKED {
            return Err(DbError::InvalidArgument(format!(
                "cannot set an unpinned page dirty: file {} page {}",
                fh.file_info().path().display(),
                page_idx
            )));
        }
        state.set_dirty();
        Ok(())
    }

    /// Runs `reader` over the page's bytes without pinning. The reader may
    /// run more than once: if a concurrent writer or eviction races with the
    /// read, the observation is discarded and the reader is re-invoked (on
    /// the slow path, under a real pin). Side effects must therefore be
    /// idempotent. Every invocation sees bytes that were, at some instant,
    /// the page's complete contents; never a mix of two versions.
    pub fn optimistic_read<F>(
        &self,
        fh: &Arc<BmFileHandle>,
        page_idx: PageIdx,
        mut reader: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        if page_idx == INVALID_PAGE_IDX {
            reader(&[]);
            return Ok(());
        }
        fh.verify_page_idx(page_idx)?;
        let state = fh.page_state(page_idx);
        loop {
            let word = state.load();
            match PageState::state_of(word) {
                PageState::UNLOCKED => {
                    let frame = self.frame_ptr(fh, page_idx);
                    let bytes =
                        unsafe { std::slice::from_raw_parts(frame, fh.page_size() as usize) };
                    reader(bytes);
                    if state.load() == word {
                        return Ok(());
                    }
                }
                PageState::MARKED => {
                    // Clear the eviction hint, then retry as UNLOCKED.
                    state.try_clear_mark(word);
                }
                PageState::EVICTED => {
                    let frame = self.pin_raw(fh, page_idx, PageReadPolicy::ReadPage)?;
                    let bytes =
                        unsafe { std::slice::from_raw_parts(frame, fh.page_size() as usize) };
                    reader(bytes);
                    self.unpin(fh, page_idx);
                    return Ok(());
                }
                _ => std::hint::spin_loop(),
            }
        }
    }

    /// Writes every dirty page of `fh` back to disk and clears the dirty
    /// bits. Intended for quiesced single-writer contexts (commit paths);
    /// spins if another thread holds one of the pages pinned.
    pub fn flush_all_dirty_pages(&self, fh: &Arc<BmFileHandle>) -> Result<()> {
        if fh.is_in_mem_temp() {
            return Ok(());
        }
        for page_idx in 0..fh.num_pages() {
            let state = fh.page_state(page_idx);
            loop {
                let word = state.load();
                match PageState::state_of(word) {
                    PageState::EVICTED => break,
                    PageState::LOCKED => std::hint::spin_loop(),
                    _ => {
                        if state.try_lock(word) {
                            let result = self.flush_if_dirty_locked(fh, page_idx);
                            state.unlock();
                            result?;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn flush_if_dirty_locked(&self, fh: &Arc<BmFileHandle>, page_idx: PageIdx) -> Result<()> {
        let state = fh.page_state(page_idx);
        if state.is_dirty() {
            let frame = self.frame_ptr(fh, page_idx);
            let bytes = unsafe { std::slice::from_raw_parts(frame, fh.page_size() as usize) };
            fh.write_page(bytes, page_idx)?;
            state.clear_dirty_unchecked();
        }
        Ok(())
    }

    /// Drops every frame currently backing a page of `fh`, without flushing.
    pub fn remove_file_pages_from_frames(&self, fh: &Arc<BmFileHandle>) {
        for page_idx in 0..fh.num_pages() {
            self.remove_page_from_frame(fh, page_idx, false);
        }
    }

    /// Drops the frame backing one page, if there is one. Used when a page
    /// is about to be truncated away.
    pub fn remove_page_from_frame_if_necessary(&self, fh: &Arc<BmFileHandle>, page_idx: PageIdx) {
        if page_idx >= fh.num_pages() {
            return;
        }
        self.remove_page_from_frame(fh, page_idx, false);
    }

    /// If the page currently has a frame, overwrites the frame's bytes with
    /// `new_page`. Checkpointing uses this to keep cached pages coherent
    /// after rewriting them on disk; the caller must have quiesced all
    /// other access to the file.
    pub fn update_frame_if_page_is_in_frame(
        &self,
        fh: &Arc<BmFileHandle>,
        new_page: &[u8],
        page_idx: PageIdx,
    ) {
        if page_idx >= fh.num_pages() {
            return;
        }
        let state = fh.page_state(page_idx);
        if PageState::state_of(state.load()) != PageState::EVICTED {
            let frame = self.frame_ptr(fh, page_idx);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    new_page.as_ptr(),
                    frame,
                    new_page.len().min(fh.page_size() as usize),
                );
            }
        }
    }

    fn remove_page_from_frame(&self, fh: &Arc<BmFileHandle>, page_idx: PageIdx, should_flush: bool) {
        let state = fh.page_state(page_idx);
        loop {
            let word = state.load();
            match PageState::state_of(word) {
                PageState::EVICTED => return,
                PageState::LOCKED => std::hint::spin_loop(),
                _ => {
                    if state.try_lock(word) {
                        break;
                    }
                }
            }
        }
        if should_flush {
            if let Err(e) = self.flush_if_dirty_locked(fh, page_idx) {
                warn!(page_idx, error = %e, "failed to flush page while removing it from its frame");
            }
        }
        fh.vm_region().release_frame(fh.frame_idx(page_idx));
        self.used_memory.fetch_sub(fh.page_size(), Ordering::SeqCst);
        state.evict();
    }

    fn frame_ptr(&self, fh: &BmFileHandle, page_idx: PageIdx) -> *mut u8 {
        fh.vm_region().get_frame(fh.frame_idx(page_idx))
    }

    /// Makes room for one page and loads it into its frame. The caller has
    /// already moved the page's state to LOCKED; on error all reservations
    /// are undone and the caller restores the state word.
    fn claim_frame(
        &self,
        fh: &Arc<BmFileHandle>,
        page_idx: PageIdx,
        policy: PageReadPolicy,
    ) -> Result<()> {
        let page_size = fh.page_size();
        // Reserve the memory first; eviction then works the reservation off.
        let mut used = self.used_memory.fetch_add(page_size, Ordering::SeqCst) + page_size;
        let mut claimed = 0u64;
        while used.saturating_sub(claimed) > self.buffer_pool_size.load(Ordering::SeqCst) {
            let Some(candidate) = self.eviction_queue.dequeue() else {
                self.used_memory
                    .fetch_sub(page_size + claimed, Ordering::SeqCst);
                return Err(DbError::BufferManagerOom(format!(
                    "failed to claim a frame of {} bytes; buffer pool of {} bytes is fully pinned",
                    page_size,
                    self.buffer_pool_size.load(Ordering::SeqCst)
                )));
            };
            claimed += self.try_evict(candidate);
            used = self.used_memory.load(Ordering::SeqCst);
        }
        if let Err(e) = self.cache_page_into_frame(fh, page_idx, policy) {
            self.used_memory
                .fetch_sub(page_size + claimed, Ordering::SeqCst);
            return Err(e);
        }
        self.used_memory.fetch_sub(claimed, Ordering::SeqCst);
        Ok(())
    }

    fn cache_page_into_frame(
        &self,
        fh: &Arc<BmFileHandle>,
        page_idx: PageIdx,
        policy: PageReadPolicy,
    ) -> Result<()> {
        let state = fh.page_state(page_idx);
        state.clear_dirty_unchecked();
        if policy == PageReadPolicy::ReadPage && !fh.is_in_mem_temp() {
            let frame = self.frame_ptr(fh, page_idx);
            let bytes = unsafe { std::slice::from_raw_parts_mut(frame, fh.page_size() as usize) };
            fh.read_page(bytes, page_idx)?;
        }
        Ok(())
    }

    /// Second-chance eviction. Returns the number of bytes freed (0 when
    /// the candidate is stale, just got its second chance, or lost a race).
    fn try_evict(&self, candidate: EvictionCandidate) -> u64 {
        let Some(fh) = candidate.file_handle.upgrade() else {
            return 0;
        };
        let Some(state) = fh.page_state_checked(candidate.page_idx) else {
            return 0;
        };
        let word = state.load();
        if PageState::version_of(word) != candidate.version {
            return 0;
        }
        match PageState::state_of(word) {
            PageState::UNLOCKED => {
                // First pass: mark, requeue, and let a later pass evict it
                // unless someone touches the page in between.
                state.try_mark(word);
                self.eviction_queue.enqueue(candidate);
                0
            }
            PageState::MARKED => {
                if !state.try_lock(word) {
                    return 0;
                }
                if state.is_dirty() {
                    if fh.is_in_mem_temp() {
                        // Nothing to write the bytes back to; the page must
                        // stay resident until its owner drops it.
                        state.unlock();
                        return 0;
                    }
                    if let Err(e) = self.flush_if_dirty_locked(&fh, candidate.page_idx) {
                        warn!(page_idx = candidate.page_idx, error = %e,
                            "failed to write back dirty page; skipping eviction");
                        state.unlock();
                        return 0;
                    }
                }
                fh.vm_region().release_frame(fh.frame_idx(candidate.page_idx));
                state.evict();
                fh.page_size()
            }
            _ => 0,
        }
    }

    fn add_to_eviction_queue(&self, fh: &Arc<BmFileHandle>, page_idx: PageIdx, version: u64) {
        let insertions = self
            .eviction_queue
            .num_insertions
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        if insertions % BufferPoolConstants::EVICTION_QUEUE_PURGING_INTERVAL == 0 {
            self.eviction_queue.remove_non_evictable_candidates();
        }
        self.eviction_queue.enqueue(EvictionCandidate {
            file_handle: Arc::downgrade(fh),
            page_idx,
            version,
        });
    }
}
