//! The write-ahead log: an append-only record stream plus the shadow pages
//! it references, both stored in one buffer-managed file.
//!
//! On disk the WAL is a chain of 4 KiB header pages. Each header page starts
//! with `{ u64 num_records, u64 next_header_page }` and is followed by
//! packed records. Shadow pages live at whatever page indices
//! `add_new_page` handed out while records were appended; the records point
//! at them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::constants::{BufferPoolConstants, StorageConstants};
use crate::common::types::PageIdx;
use crate::error::{DbError, Result};
use crate::storage::buffer_manager::{BmFileHandle, BufferManager, FileFlags};
use crate::storage::wal::wal_record::{DbFileId, WalRecord};

const HEADER_PAGE_SIZE: usize = BufferPoolConstants::PAGE_4KB_SIZE as usize;
const NUM_RECORDS_FIELD: usize = 0;
const NEXT_HEADER_PAGE_FIELD: usize = 8;
pub(crate) const HEADER_PAGE_PREFIX_SIZE: usize = 16;
const NULL_HEADER_PAGE: u64 = u64::MAX;

struct WalState {
    header_page_buffer: Box<[u8; HEADER_PAGE_SIZE]>,
    offset_in_header_page: usize,
    current_header_page_idx: PageIdx,
    last_record_is_commit: bool,
}

impl WalState {
    fn new() -> Self {
        let mut state = Self {
            header_page_buffer: Box::new([0u8; HEADER_PAGE_SIZE]),
            offset_in_header_page: HEADER_PAGE_PREFIX_SIZE,
            current_header_page_idx: 0,
            last_record_is_commit: false,
        };
        state.reset_header_page_prefix();
        state
    }

    fn num_records(&self) -> u64 {
        u64::from_le_bytes(
            self.header_page_buffer[NUM_RECORDS_FIELD..NUM_RECORDS_FIELD + 8]
                .try_into()
                .unwrap(),
        )
    }

    fn increment_num_records(&mut self) {
        let n = self.num_records() + 1;
        self.header_page_buffer[NUM_RECORDS_FIELD..NUM_RECORDS_FIELD + 8]
            .copy_from_slice(&n.to_le_bytes());
    }

    fn set_next_header_page(&mut self, next: u64) {
        self.header_page_buffer[NEXT_HEADER_PAGE_FIELD..NEXT_HEADER_PAGE_FIELD + 8]
            .copy_from_slice(&next.to_le_bytes());
    }

    fn reset_header_page_prefix(&mut self) {
        self.header_page_buffer[NUM_RECORDS_FIELD..NUM_RECORDS_FIELD + 8].fill(0);
        self.set_next_header_page(NULL_HEADER_PAGE);
        self.offset_in_header_page = HEADER_PAGE_PREFIX_SIZE;
    }

    fn is_empty(&self) -> bool {
        self.current_header_page_idx == 0 && self.num_records() == 0
    }
}

/// The WAL coordinator. Appends serialize on an internal mutex; shadow page
/// contents are written by callers through pinned frames of the WAL's file
/// handle.
///
/// In in-memory mode the WAL is disabled: no log file exists and the
/// storage structures write base pages directly.
pub struct Wal {
    bm: Arc<BufferManager>,
    fh: Option<Arc<BmFileHandle>>,
    path: PathBuf,
    state: Mutex<WalState>,
}

impl Wal {
    pub fn new(db_dir: &Path, bm: Arc<BufferManager>) -> Result<Self> {
        let path = db_dir.join(StorageConstants::WAL_FILE_NAME);
        let fh = bm.create_file_handle(&path, FileFlags::persistent_create_if_not_exists())?;
        let mut state = WalState::new();
        if fh.num_pages() == 0 {
            // Fresh WAL: reserve page 0 for the first header page. Nothing
            // is written to disk until the first flush.
            fh.add_new_page()?;
        } else {
            // A non-empty WAL awaits recovery; load the first header page so
            // the state reflects what is on disk until the replay clears it.
            fh.read_page(state.header_page_buffer.as_mut_slice(), 0)?;
        }
        Ok(Self {
            bm,
            fh: Some(fh),
            path,
            state: Mutex::new(state),
        })
    }

    /// A disabled WAL for in-memory mode: no log file exists, `log_*` calls
    /// must never be reached, and the shadow-page machinery is bypassed by
    /// its callers.
    pub fn disabled(db_dir: &Path, bm: Arc<BufferManager>) -> Self {
        Self {
            bm,
            fh: None,
            path: db_dir.join(StorageConstants::WAL_FILE_NAME),
            state: Mutex::new(WalState::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.fh.is_some()
    }

    /// The WAL's own file handle; shadow pages are pinned through it.
    pub fn file_handle(&self) -> &Arc<BmFileHandle> {
        self.fh
            .as_ref()
            .expect("WAL file handle accessed in in-memory mode")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a shadow page for an update of `original_page_idx` and logs
    /// the binding. Returns the shadow's page index in the WAL file.
    pub fn log_page_shadow_record(
        &self,
        db_file_id: DbFileId,
        original_page_idx: PageIdx,
    ) -> Result<PageIdx> {
        let page_idx_in_wal = self.file_handle().add_new_page()?;
        self.append_record(&WalRecord::PageShadow {
            db_file_id,
            original_page_idx,
            page_idx_in_wal,
        })?;
        Ok(page_idx_in_wal)
    }

    /// Like `log_page_shadow_record`, but for a base page newly added in
    /// this transaction.
    pub fn log_page_insert_record(
        &self,
        db_file_id: DbFileId,
        new_original_page_idx: PageIdx,
    ) -> Result<PageIdx> {
        let page_idx_in_wal = self.file_handle().add_new_page()?;
        self.append_record(&WalRecord::PageInsert {
            db_file_id,
            original_page_idx: new_original_page_idx,
            page_idx_in_wal,
        })?;
        Ok(page_idx_in_wal)
    }

    pub fn log_overflow_next_byte_pos_record(&self, db_file_id: DbFileId, pos: u64) -> Result<()> {
        self.append_record(&WalRecord::OverflowNextBytePos { db_file_id, pos })
    }

    pub fn log_commit(&self, transaction_id: u64) -> Result<()> {
        self.append_record(&WalRecord::Commit { transaction_id })
    }

    fn append_record(&self, record: &WalRecord) -> Result<()> {
        let fh = self.file_handle();
        let mut state = self.state.lock();
        if state.offset_in_header_page + record.num_bytes() > HEADER_PAGE_SIZE {
            // Chain a new header page; the full one goes to disk now.
            let next_header_page_idx = fh.add_new_page()?;
            state.set_next_header_page(next_header_page_idx as u64);
            fh.write_page(
                state.header_page_buffer.as_slice(),
                state.current_header_page_idx,
            )?;
            state.current_header_page_idx = next_header_page_idx;
            state.reset_header_page_prefix();
        }
        let mut offset = state.offset_in_header_page;
        record.write_to(state.header_page_buffer.as_mut_slice(), &mut offset);
        state.offset_in_header_page = offset;
        state.increment_num_records();
        state.last_record_is_commit = matches!(record, WalRecord::Commit { .. });
        Ok(())
    }

    pub fn last_logged_record_is_commit(&self) -> bool {
        self.state.lock().last_record_is_commit
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// Flushes the current header page, every dirty shadow page, and syncs
    /// the file. After this returns, the log's contents survive a crash.
    pub fn flush_all_pages(&self) -> Result<()> {
        let fh = self.file_handle();
        {
            let state = self.state.lock();
            if state.is_empty() {
                return Ok(());
            }
            fh.write_page(
                state.header_page_buffer.as_slice(),
                state.current_header_page_idx,
            )?;
        }
        self.bm.flush_all_dirty_pages(fh)?;
        fh.file_info().sync()?;
        Ok(())
    }

    /// Empties the WAL: drops all frames, truncates the file to zero bytes,
    /// and reserves a fresh header page.
    pub fn clear(&self) -> Result<()> {
        let fh = self.file_handle();
        let mut state = self.state.lock();
        self.bm.remove_file_pages_from_frames(fh);
        fh.reset_to_zero_pages_and_page_capacity()?;
        fh.add_new_page()?;
        *state = WalState::new();
        debug!("WAL cleared");
        Ok(())
    }

    /// Iterates the records currently on disk. The caller must have flushed
    /// the WAL first (or be recovering a WAL written by another process).
    pub fn iterator(&self) -> Result<WalIterator> {
        WalIterator::new(Arc::clone(self.file_handle()))
    }
}

/// Streams records back out of the header-page chain.
pub struct WalIterator {
    fh: Arc<BmFileHandle>,
    page_buffer: Box<[u8; HEADER_PAGE_SIZE]>,
    offset_in_page: usize,
    records_left_in_page: u64,
    has_page: bool,
}

impl WalIterator {
    fn new(fh: Arc<BmFileHandle>) -> Result<Self> {
        let mut iter = Self {
            fh,
            page_buffer: Box::new([0u8; HEADER_PAGE_SIZE]),
            offset_in_page: HEADER_PAGE_PREFIX_SIZE,
            records_left_in_page: 0,
            has_page: false,
        };
        if iter.fh.num_pages() > 0 && !iter.fh.file_info().is_in_mem() {
            iter.load_header_page(0)?;
        }
        Ok(iter)
    }

    fn load_header_page(&mut self, page_idx: PageIdx) -> Result<()> {
        self.fh
            .read_page(self.page_buffer.as_mut_slice(), page_idx)?;
        self.records_left_in_page = u64::from_le_bytes(self.page_buffer[0..8].try_into().unwrap());
        self.offset_in_page = HEADER_PAGE_PREFIX_SIZE;
        self.has_page = true;
        Ok(())
    }

    /// A usable next-header pointer. A crash can leave a chained header
    /// page unwritten; such a page reads as zeroes, and a zero pointer (or
    /// one past the end of the file) marks the end of the recoverable log
    /// rather than a chain to follow.
    fn next_header_page(&self) -> Option<PageIdx> {
        let next = u64::from_le_bytes(self.page_buffer[8..16].try_into().unwrap());
        if next == NULL_HEADER_PAGE || next == 0 || next >= self.fh.num_pages() as u64 {
            None
        } else {
            Some(next as PageIdx)
        }
    }

    pub fn has_next_record(&self) -> bool {
        self.has_page && self.records_left_in_page > 0
    }

    pub fn next_record(&mut self) -> Result<WalRecord> {
        if !self.has_next_record() {
            return Err(DbError::CorruptWal(
                "iterated past the last record".to_string(),
            ));
        }
        let record = WalRecord::read_from(self.page_buffer.as_slice(), &mut self.offset_in_page)?;
        self.records_left_in_page -= 1;
        if self.records_left_in_page == 0 {
            if let Some(next) = self.next_header_page() {
                // An unwritten chained page loads with zero records and
                // ends the iteration gracefully.
                self.load_header_page(next)?;
            }
        }
        Ok(record)
    }
}
