//! A growable on-disk array of fixed-size elements.
//!
//! Physically the array is a header (element count + pointer to the first
//! PIP), a linked chain of PIPs (page-indices pages) enumerating the array
//! pages, and the array pages themselves. All three kinds of page live in
//! one buffer-managed file; a single file can host several disk arrays by
//! giving each its own header page.
//!
//! Reads come in two flavors selected by transaction type: the read view is
//! the state persisted at the last checkpoint, the write view additionally
//! sees the running write transaction's WAL shadows and in-memory PIP/header
//! updates. The two views flip atomically at checkpoint/rollback.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::common::constants::BufferPoolConstants;
use crate::common::types::{PageCursor, PageIdx, INVALID_PAGE_IDX};
use crate::error::{DbError, Result};
use crate::storage::buffer_manager::{BmFileHandle, BufferManager};
use crate::storage::db_file_registry::Checkpointable;
use crate::storage::storage_structure::db_file_utils::{
    self, file_handle_and_physical_page_idx_to_pin, ShadowPageAndFrame,
};
use crate::storage::wal::wal::Wal;
use crate::storage::wal::wal_record::DbFileId;
use crate::transaction::TransactionType;

const PAGE_SIZE: usize = BufferPoolConstants::PAGE_4KB_SIZE as usize;

/// Page indices per PIP: a 4 KiB page minus the next-PIP pointer, divided
/// into u32 page indices.
pub const NUM_PAGE_IDXS_PER_PIP: usize = (PAGE_SIZE - 4) / 4;

/// { num_elements: u64, first_pip_page_idx: u32 }, at the start of the
/// array's header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskArrayHeader {
    pub num_elements: u64,
    pub first_pip_page_idx: PageIdx,
}

impl DiskArrayHeader {
    fn empty() -> Self {
        Self {
            num_elements: 0,
            first_pip_page_idx: INVALID_PAGE_IDX,
        }
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            num_elements: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            first_pip_page_idx: PageIdx::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.num_elements.to_le_bytes());
        buf[8..12].copy_from_slice(&self.first_pip_page_idx.to_le_bytes());
    }
}

#[derive(Clone)]
struct Pip {
    next_pip_page_idx: PageIdx,
    page_idxs: Box<[PageIdx; NUM_PAGE_IDXS_PER_PIP]>,
}

impl Pip {
    fn empty() -> Self {
        Self {
            next_pip_page_idx: INVALID_PAGE_IDX,
            page_idxs: Box::new([INVALID_PAGE_IDX; NUM_PAGE_IDXS_PER_PIP]),
        }
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut pip = Self::empty();
        pip.next_pip_page_idx = PageIdx::from_le_bytes(buf[0..4].try_into().unwrap());
        for (i, idx) in pip.page_idxs.iter_mut().enumerate() {
            let at = 4 + i * 4;
            *idx = PageIdx::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        }
        pip
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.next_pip_page_idx.to_le_bytes());
        for (i, idx) in self.page_idxs.iter().enumerate() {
            let at = 4 + i * 4;
            buf[at..at + 4].copy_from_slice(&idx.to_le_bytes());
        }
    }
}

#[derive(Clone)]
struct PipWrapper {
    pip_page_idx: PageIdx,
    pip: Pip,
}

impl PipWrapper {
    fn empty(pip_page_idx: PageIdx) -> Self {
        Self {
            pip_page_idx,
            pip: Pip::empty(),
        }
    }
}

/// In-memory PIP changes of the running write transaction. PIPs are
/// append-only, so at most the last persisted PIP is ever modified; the
/// rest of the updates are brand-new PIPs.
#[derive(Default)]
struct PipUpdates {
    updated_last_pip: Option<PipWrapper>,
    new_pips: Vec<PipWrapper>,
}

impl PipUpdates {
    fn clear(&mut self) {
        self.updated_last_pip = None;
        self.new_pips.clear();
    }
}

/// Element-size-derived addressing: elements are padded to the next power
/// of two and packed `num_elements_per_page` to an array page.
#[derive(Debug, Clone, Copy)]
struct PageStorageInfo {
    aligned_element_size: usize,
    num_elements_per_page: u64,
}

impl PageStorageInfo {
    fn new(element_size: usize) -> Result<Self> {
        if element_size == 0 || element_size > PAGE_SIZE {
            return Err(DbError::InvalidArgument(format!(
                "disk array element size {element_size} must be between 1 and {PAGE_SIZE} bytes"
            )));
        }
        let aligned_element_size = element_size.next_power_of_two();
        Ok(Self {
            aligned_element_size,
            num_elements_per_page: (PAGE_SIZE / aligned_element_size) as u64,
        })
    }

    /// Logical array-page index and byte offset of element `idx`.
    fn cursor_for(&self, idx: u64) -> PageCursor {
        PageCursor {
            page_idx: (idx / self.num_elements_per_page) as PageIdx,
            elem_pos_in_page: ((idx % self.num_elements_per_page)
                * self.aligned_element_size as u64) as u32,
        }
    }

    fn num_array_pages(&self, num_elements: u64) -> u64 {
        num_elements.div_ceil(self.num_elements_per_page)
    }
}

struct DiskArrayState {
    header: DiskArrayHeader,
    header_for_write_trx: DiskArrayHeader,
    pips: Vec<PipWrapper>,
    pip_updates: PipUpdates,
    has_transactional_updates: bool,
    // Pages at or past this index were added by the running transaction;
    // with `bypass_wal` they are written directly instead of shadowed.
    last_page_on_disk: PageIdx,
}

/// Untyped core of a disk array, operating on byte spans. [`DiskArray`]
/// wraps it with a typed element interface.
pub struct DiskArrayInternal {
    fh: Arc<BmFileHandle>,
    db_file_id: DbFileId,
    header_page_idx: PageIdx,
    bm: Arc<BufferManager>,
    wal: Arc<Wal>,
    storage_info: PageStorageInfo,
    bypass_wal: bool,
    element_size: usize,
    state: RwLock<DiskArrayState>,
}

impl DiskArrayInternal {
    /// Opens the array stored at `header_page_idx` of `fh`, creating an
    /// empty one (and the header page itself) if the page does not exist
    /// yet.
    ///
    /// With `bypass_wal`, array pages new to a transaction are written to
    /// the base file through the buffer manager instead of WAL shadows;
    /// `prepare_commit` then flushes them. Rollback does not reclaim such
    /// pages, so only bulk-load style structures should opt in.
    pub fn open(
        fh: Arc<BmFileHandle>,
        db_file_id: DbFileId,
        header_page_idx: PageIdx,
        bm: Arc<BufferManager>,
        wal: Arc<Wal>,
        element_size: usize,
        bypass_wal: bool,
    ) -> Result<Self> {
        let storage_info = PageStorageInfo::new(element_size)?;
        let header = if fh.file_info().is_in_mem() {
            // In-memory arrays always start empty; there is nothing to load.
            while fh.num_pages() <= header_page_idx {
                fh.add_new_page()?;
            }
            DiskArrayHeader::empty()
        } else if header_page_idx < fh.num_pages() {
            let mut buf = [0u8; PAGE_SIZE];
            fh.read_page(&mut buf, header_page_idx)?;
            DiskArrayHeader::read_from(&buf)
        } else {
            while fh.num_pages() <= header_page_idx {
                fh.add_new_page()?;
            }
            let header = DiskArrayHeader::empty();
            let mut buf = [0u8; PAGE_SIZE];
            header.write_to(&mut buf);
            fh.write_page(&buf, header_page_idx)?;
            header
        };
        let mut pips = Vec::new();
        let mut pip_page_idx = header.first_pip_page_idx;
        while pip_page_idx != INVALID_PAGE_IDX {
            if pip_page_idx >= fh.num_pages() {
                return Err(DbError::InvalidArgument(format!(
                    "PIP chain points past the end of file {}: page {}",
                    fh.file_info().path().display(),
                    pip_page_idx
                )));
            }
            let mut buf = [0u8; PAGE_SIZE];
            fh.read_page(&mut buf, pip_page_idx)?;
            let pip = Pip::read_from(&buf);
            let next = pip.next_pip_page_idx;
            pips.push(PipWrapper { pip_page_idx, pip });
            pip_page_idx = next;
        }
        let last_page_on_disk = fh.num_pages();
        Ok(Self {
            fh,
            db_file_id,
            header_page_idx,
            bm,
            wal,
            storage_info,
            bypass_wal,
            element_size,
            state: RwLock::new(DiskArrayState {
                header,
                header_for_write_trx: header,
                pips,
                pip_updates: PipUpdates::default(),
                has_transactional_updates: false,
                last_page_on_disk,
            }),
        })
    }

    pub fn num_elements(&self, trx_type: TransactionType) -> u64 {
        let state = self.state.read();
        match trx_type {
            TransactionType::ReadOnly => state.header.num_elements,
            TransactionType::Write => state.header_for_write_trx.num_elements,
        }
    }

    /// Copies element `idx` into `out` (`element_size` bytes).
    pub fn get(&self, idx: u64, trx_type: TransactionType, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.element_size);
        let state = self.state.read();
        let header = match trx_type {
            TransactionType::ReadOnly => &state.header,
            TransactionType::Write => &state.header_for_write_trx,
        };
        if idx >= header.num_elements {
            return Err(DbError::InvalidArgument(format!(
                "disk array index {idx} out of bounds ({} elements)",
                header.num_elements
            )));
        }
        let cursor = self.storage_info.cursor_for(idx);
        let ap_page_idx = self.ap_page_idx(&state, cursor.page_idx, trx_type)?;
        drop(state);
        let (fh_to_pin, page_idx_to_pin) =
            file_handle_and_physical_page_idx_to_pin(&self.fh, ap_page_idx, &self.wal, trx_type);
        let offset = cursor.elem_pos_in_page as usize;
        let len = out.len();
        self.bm.optimistic_read(&fh_to_pin, page_idx_to_pin, |frame| {
            out.copy_from_slice(&frame[offset..offset + len]);
        })
    }

    /// WRITE transactions only: overwrites element `idx` in the shadowed
    /// version of its array page.
    pub fn update(&self, idx: u64, val: &[u8]) -> Result<()> {
        debug_assert_eq!(val.len(), self.element_size);
        let mut state = self.state.write();
        state.has_transactional_updates = true;
        if idx >= state.header_for_write_trx.num_elements {
            return Err(DbError::InvalidArgument(format!(
                "disk array index {idx} out of bounds ({} elements)",
                state.header_for_write_trx.num_elements
            )));
        }
        let cursor = self.storage_info.cursor_for(idx);
        let ap_page_idx = self.ap_page_idx(&state, cursor.page_idx, TransactionType::Write)?;
        let is_new_page = ap_page_idx >= state.last_page_on_disk;
        let mut frame = self.pin_for_write(ap_page_idx, is_new_page)?;
        let offset = cursor.elem_pos_in_page as usize;
        frame[offset..offset + val.len()].copy_from_slice(val);
        Ok(())
    }

    /// WRITE transactions only: appends `val` and returns its index.
    pub fn push_back(&self, val: &[u8]) -> Result<u64> {
        let mut state = self.state.write();
        self.push_back_no_lock(&mut state, val)
    }

    /// WRITE transactions only: grows the array to `new_num_elements` by
    /// appending `default_val`. Never shrinks. Returns the new count.
    pub fn resize(&self, new_num_elements: u64, default_val: &[u8]) -> Result<u64> {
        let mut state = self.state.write();
        while state.header_for_write_trx.num_elements < new_num_elements {
            self.push_back_no_lock(&mut state, default_val)?;
        }
        Ok(state.header_for_write_trx.num_elements)
    }

    fn push_back_no_lock(&self, state: &mut DiskArrayState, val: &[u8]) -> Result<u64> {
        debug_assert_eq!(val.len(), self.element_size);
        state.has_transactional_updates = true;
        let idx = state.header_for_write_trx.num_elements;
        let cursor = self.storage_info.cursor_for(idx);
        let (ap_page_idx, is_newly_added) =
            self.ap_page_idx_and_add_ap_to_pip_if_necessary(state, cursor.page_idx)?;
        let is_new_page = is_newly_added || ap_page_idx >= state.last_page_on_disk;
        {
            let mut frame = self.pin_for_write(ap_page_idx, is_new_page)?;
            let offset = cursor.elem_pos_in_page as usize;
            frame[offset..offset + val.len()].copy_from_slice(val);
        }
        state.header_for_write_trx.num_elements = idx + 1;
        Ok(idx)
    }

    /// Persists the write transaction's header and PIP updates into WAL
    /// shadows; with `bypass_wal`, also flushes the directly-written array
    /// pages. Must run before the COMMIT record is logged.
    pub fn prepare_commit(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if !state.has_transactional_updates {
            return Ok(());
        }
        if state.header_for_write_trx != state.header {
            let header = state.header_for_write_trx;
            db_file_utils::update_page(
                &self.fh,
                self.db_file_id,
                self.header_page_idx,
                false,
                &self.bm,
                &self.wal,
                |frame| header.write_to(frame),
            )?;
        }
        if let Some(updated) = &state.pip_updates.updated_last_pip {
            db_file_utils::update_page(
                &self.fh,
                self.db_file_id,
                updated.pip_page_idx,
                false,
                &self.bm,
                &self.wal,
                |frame| updated.pip.write_to(frame),
            )?;
        }
        for new_pip in &state.pip_updates.new_pips {
            db_file_utils::update_page(
                &self.fh,
                self.db_file_id,
                new_pip.pip_page_idx,
                true,
                &self.bm,
                &self.wal,
                |frame| new_pip.pip.write_to(frame),
            )?;
        }
        if self.bypass_wal && self.wal.is_enabled() {
            self.bm.flush_all_dirty_pages(&self.fh)?;
        }
        Ok(())
    }

    /// Publishes the write transaction's view as the new read view.
    pub fn checkpoint_in_memory(&self) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.header = state.header_for_write_trx;
        if let Some(updated) = state.pip_updates.updated_last_pip.take() {
            let last = state.pips.len() - 1;
            state.pips[last] = updated;
        }
        state.pips.append(&mut state.pip_updates.new_pips);
        state.pip_updates.clear();
        state.has_transactional_updates = false;
        state.last_page_on_disk = self.fh.num_pages();
    }

    /// Discards the write transaction's view. File truncation of inserted
    /// pages is the WAL replayer's job and must happen before this call.
    pub fn rollback_in_memory(&self) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.header_for_write_trx = state.header;
        state.pip_updates.clear();
        state.has_transactional_updates = false;
        state.last_page_on_disk = self.fh.num_pages();
    }

    /// Sequential bulk-update iterator; see [`WriteIterator`].
    pub fn iter_mut(&self) -> WriteIteratorInternal<'_> {
        let mut state = self.state.write();
        state.has_transactional_updates = true;
        WriteIteratorInternal {
            da: self,
            state,
            idx: 0,
            cursor: PageCursor::new(INVALID_PAGE_IDX, 0),
            pinned: None,
        }
    }

    /// Physical page index of logical array page `ap_idx`.
    fn ap_page_idx(
        &self,
        state: &DiskArrayState,
        ap_idx: PageIdx,
        trx_type: TransactionType,
    ) -> Result<PageIdx> {
        let pip_idx = ap_idx as usize / NUM_PAGE_IDXS_PER_PIP;
        let pos = ap_idx as usize % NUM_PAGE_IDXS_PER_PIP;
        let page_idx = match trx_type {
            TransactionType::ReadOnly => state.pips[pip_idx].pip.page_idxs[pos],
            TransactionType::Write => {
                if pip_idx >= state.pips.len() {
                    state.pip_updates.new_pips[pip_idx - state.pips.len()]
                        .pip
                        .page_idxs[pos]
                } else if pip_idx + 1 == state.pips.len() {
                    match &state.pip_updates.updated_last_pip {
                        Some(updated) => updated.pip.page_idxs[pos],
                        None => state.pips[pip_idx].pip.page_idxs[pos],
                    }
                } else {
                    state.pips[pip_idx].pip.page_idxs[pos]
                }
            }
        };
        debug_assert_ne!(page_idx, INVALID_PAGE_IDX);
        Ok(page_idx)
    }

    /// Resolves the array page for `ap_idx` in the write view, allocating
    /// the page (and a new PIP, when the last one is full) if `ap_idx` is
    /// one past the end. Returns the physical page index and whether it was
    /// newly allocated.
    fn ap_page_idx_and_add_ap_to_pip_if_necessary(
        &self,
        state: &mut DiskArrayState,
        ap_idx: PageIdx,
    ) -> Result<(PageIdx, bool)> {
        let num_aps = self
            .storage_info
            .num_array_pages(state.header_for_write_trx.num_elements);
        if (ap_idx as u64) < num_aps {
            return Ok((self.ap_page_idx(state, ap_idx, TransactionType::Write)?, false));
        }
        debug_assert_eq!(ap_idx as u64, num_aps);
        let new_ap_page_idx = if self.direct_write_for_new_pages() {
            let page_idx = self.fh.add_new_page()?;
            // Zero it through its frame so eviction flushes defined bytes.
            db_file_utils::pin_page_direct(page_idx, true, &self.fh, &self.bm)?;
            page_idx
        } else {
            db_file_utils::insert_new_page(&self.fh, self.db_file_id, &self.bm, &self.wal, |_| {})?
        };
        let pip_idx = ap_idx as usize / NUM_PAGE_IDXS_PER_PIP;
        let pos = ap_idx as usize % NUM_PAGE_IDXS_PER_PIP;
        let num_pips = state.pips.len() + state.pip_updates.new_pips.len();
        if pip_idx == num_pips {
            let pip_page_idx = self.fh.add_new_page()?;
            if pip_idx == 0 {
                state.header_for_write_trx.first_pip_page_idx = pip_page_idx;
            } else {
                Self::set_next_pip_page_idx(state, pip_idx - 1, pip_page_idx);
            }
            state.pip_updates.new_pips.push(PipWrapper::empty(pip_page_idx));
        }
        Self::set_pip_entry(state, pip_idx, pos, new_ap_page_idx);
        Ok((new_ap_page_idx, true))
    }

    fn direct_write_for_new_pages(&self) -> bool {
        !self.wal.is_enabled() || self.bypass_wal
    }

    fn set_pip_entry(state: &mut DiskArrayState, pip_idx: usize, pos: usize, page_idx: PageIdx) {
        let DiskArrayState {
            pips, pip_updates, ..
        } = state;
        if pip_idx < pips.len() {
            debug_assert_eq!(pip_idx + 1, pips.len());
            let updated = pip_updates
                .updated_last_pip
                .get_or_insert_with(|| pips[pip_idx].clone());
            updated.pip.page_idxs[pos] = page_idx;
        } else {
            pip_updates.new_pips[pip_idx - pips.len()].pip.page_idxs[pos] = page_idx;
        }
    }

    fn set_next_pip_page_idx(state: &mut DiskArrayState, pip_idx: usize, next: PageIdx) {
        let DiskArrayState {
            pips, pip_updates, ..
        } = state;
        if pip_idx < pips.len() {
            debug_assert_eq!(pip_idx + 1, pips.len());
            let updated = pip_updates
                .updated_last_pip
                .get_or_insert_with(|| pips[pip_idx].clone());
            updated.pip.next_pip_page_idx = next;
        } else {
            pip_updates.new_pips[pip_idx - pips.len()]
                .pip
                .next_pip_page_idx = next;
        }
    }

    fn pin_for_write(&self, page_idx: PageIdx, is_new_page: bool) -> Result<ShadowPageAndFrame<'_>> {
        if !self.wal.is_enabled() || (self.bypass_wal && is_new_page) {
            // The page was zeroed when allocated; later writes must keep
            // its accumulated contents.
            db_file_utils::pin_page_direct(page_idx, false, &self.fh, &self.bm)
        } else {
            db_file_utils::create_shadow_version_if_necessary_and_pin_page(
                page_idx,
                is_new_page,
                &self.fh,
                self.db_file_id,
                &self.bm,
                &self.wal,
            )
        }
    }
}

/// Sequential bulk updates: keeps the current array page pinned while
/// consecutive writes stay on it, re-resolving only when stepping off the
/// page. Holds the array's write lock for its whole lifetime, so only one
/// iterator (and no other writer) can be live at a time.
pub struct WriteIteratorInternal<'a> {
    da: &'a DiskArrayInternal,
    state: RwLockWriteGuard<'a, DiskArrayState>,
    idx: u64,
    cursor: PageCursor,
    pinned: Option<(PageIdx, ShadowPageAndFrame<'a>)>,
}

impl<'a> WriteIteratorInternal<'a> {
    pub fn idx(&self) -> u64 {
        self.idx
    }

    pub fn size(&self) -> u64 {
        self.state.header_for_write_trx.num_elements
    }

    /// Positions the iterator on element `idx`, pinning its array page.
    pub fn seek(&mut self, idx: u64) -> Result<()> {
        if idx >= self.state.header_for_write_trx.num_elements {
            return Err(DbError::InvalidArgument(format!(
                "seek past the end of the disk array: {idx}"
            )));
        }
        let cursor = self.da.storage_info.cursor_for(idx);
        self.pin_ap(cursor.page_idx)?;
        self.idx = idx;
        self.cursor = cursor;
        Ok(())
    }

    /// Appends `val` and leaves the iterator positioned on it.
    pub fn push_back(&mut self, val: &[u8]) -> Result<()> {
        let idx = self.state.header_for_write_trx.num_elements;
        let cursor = self.da.storage_info.cursor_for(idx);
        if (cursor.page_idx as u64) >= self.da.storage_info.num_array_pages(idx) {
            // The element starts a fresh array page; release the old pin
            // before allocating.
            self.unpin();
            self.da
                .ap_page_idx_and_add_ap_to_pip_if_necessary(&mut self.state, cursor.page_idx)?;
        }
        self.state.header_for_write_trx.num_elements = idx + 1;
        self.seek(idx)?;
        self.value_mut().copy_from_slice(val);
        Ok(())
    }

    /// The bytes of the current element.
    pub fn value(&self) -> &[u8] {
        let (_, frame) = self.pinned.as_ref().expect("iterator not positioned");
        let offset = self.cursor.elem_pos_in_page as usize;
        &frame[offset..offset + self.da.element_size]
    }

    /// Mutable bytes of the current element.
    pub fn value_mut(&mut self) -> &mut [u8] {
        let offset = self.cursor.elem_pos_in_page as usize;
        let element_size = self.da.element_size;
        let (_, frame) = self.pinned.as_mut().expect("iterator not positioned");
        &mut frame[offset..offset + element_size]
    }

    fn pinned_ap(&self) -> Option<PageIdx> {
        self.pinned.as_ref().map(|(ap, _)| *ap)
    }

    fn pin_ap(&mut self, ap_idx: PageIdx) -> Result<()> {
        if self.pinned_ap() == Some(ap_idx) {
            return Ok(());
        }
        self.unpin();
        let page_idx = self
            .da
            .ap_page_idx(&self.state, ap_idx, TransactionType::Write)?;
        let is_new_page = page_idx >= self.state.last_page_on_disk;
        let frame = self.da.pin_for_write(page_idx, is_new_page)?;
        self.pinned = Some((ap_idx, frame));
        Ok(())
    }

    fn unpin(&mut self) {
        self.pinned = None;
    }
}

/// Marker for types a [`DiskArray`] may store.
///
/// # Safety
///
/// Implementors must be plain bytes: no padding, no pointers or lifetimes,
/// and every bit pattern must be a valid value, since elements are
/// round-tripped through raw page bytes (and materialized zeroed).
pub unsafe trait ArrayElement: Copy + Send + Sync + 'static {}

unsafe impl ArrayElement for u8 {}
unsafe impl ArrayElement for u16 {}
unsafe impl ArrayElement for u32 {}
unsafe impl ArrayElement for u64 {}
unsafe impl ArrayElement for i8 {}
unsafe impl ArrayElement for i16 {}
unsafe impl ArrayElement for i32 {}
unsafe impl ArrayElement for i64 {}
unsafe impl<const N: usize> ArrayElement for [u8; N] {}

fn zeroed_value<T: ArrayElement>() -> T {
    // ArrayElement guarantees every bit pattern is valid.
    unsafe { std::mem::zeroed() }
}

fn value_as_bytes<T: ArrayElement>(val: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>()) }
}

fn value_as_bytes_mut<T: ArrayElement>(val: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(val as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

/// A disk array of `T` elements. Thin typed layer over
/// [`DiskArrayInternal`]; see the module docs for the storage layout and
/// transactional semantics.
pub struct DiskArray<T: ArrayElement> {
    internal: DiskArrayInternal,
    _marker: PhantomData<T>,
}

impl<T: ArrayElement> DiskArray<T> {
    pub fn open(
        fh: Arc<BmFileHandle>,
        db_file_id: DbFileId,
        header_page_idx: PageIdx,
        bm: Arc<BufferManager>,
        wal: Arc<Wal>,
        bypass_wal: bool,
    ) -> Result<Self> {
        Ok(Self {
            internal: DiskArrayInternal::open(
                fh,
                db_file_id,
                header_page_idx,
                bm,
                wal,
                std::mem::size_of::<T>(),
                bypass_wal,
            )?,
            _marker: PhantomData,
        })
    }

    pub fn num_elements(&self, trx_type: TransactionType) -> u64 {
        self.internal.num_elements(trx_type)
    }

    pub fn get(&self, idx: u64, trx_type: TransactionType) -> Result<T> {
        let mut val = zeroed_value::<T>();
        self.internal.get(idx, trx_type, value_as_bytes_mut(&mut val))?;
        Ok(val)
    }

    pub fn update(&self, idx: u64, val: T) -> Result<()> {
        self.internal.update(idx, value_as_bytes(&val))
    }

    pub fn push_back(&self, val: T) -> Result<u64> {
        self.internal.push_back(value_as_bytes(&val))
    }

    pub fn resize(&self, new_num_elements: u64, default_val: T) -> Result<u64> {
        self.internal.resize(new_num_elements, value_as_bytes(&default_val))
    }

    pub fn iter_mut(&self) -> WriteIterator<'_, T> {
        WriteIterator {
            inner: self.internal.iter_mut(),
            _marker: PhantomData,
        }
    }
}

impl<T: ArrayElement> Checkpointable for DiskArray<T> {
    fn prepare_commit(&self) -> Result<()> {
        self.internal.prepare_commit()
    }

    fn checkpoint_in_memory(&self) {
        self.internal.checkpoint_in_memory()
    }

    fn rollback_in_memory(&self) {
        self.internal.rollback_in_memory()
    }
}

/// Typed view of [`WriteIteratorInternal`].
pub struct WriteIterator<'a, T: ArrayElement> {
    inner: WriteIteratorInternal<'a>,
    _marker: PhantomData<T>,
}

impl<T: ArrayElement> WriteIterator<'_, T> {
    pub fn idx(&self) -> u64 {
        self.inner.idx()
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn seek(&mut self, idx: u64) -> Result<&mut Self> {
        self.inner.seek(idx)?;
        Ok(self)
    }

    pub fn push_back(&mut self, val: T) -> Result<&mut Self> {
        self.inner.push_back(value_as_bytes(&val))?;
        Ok(self)
    }

    pub fn get(&self) -> T {
        let mut val = zeroed_value::<T>();
        value_as_bytes_mut(&mut val).copy_from_slice(self.inner.value());
        val
    }

    pub fn set(&mut self, val: T) {
        self.inner.value_mut().copy_from_slice(value_as_bytes(&val));
    }
}
