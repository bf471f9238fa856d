//! Append-only byte store for values too large for their home column.
//!
//! Values at most 12 bytes stay inline in their [`StrHandle`]; longer ones
//! go to overflow pages addressed by (page, offset, length). The last four
//! bytes of every overflow page hold the index of the next page in a
//! value's chain, so payloads larger than one page simply continue on the
//! next page.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::constants::BufferPoolConstants;
use crate::common::types::{PageCursor, PageIdx};
use crate::error::{DbError, Result};
use crate::storage::buffer_manager::{BmFileHandle, BufferManager};
use crate::storage::db_file_registry::Checkpointable;
use crate::storage::storage_structure::db_file_utils::{
    self, file_handle_and_physical_page_idx_to_pin,
};
use crate::storage::wal::wal::Wal;
use crate::storage::wal::wal_record::DbFileId;
use crate::transaction::TransactionType;

const PAGE_SIZE: usize = BufferPoolConstants::PAGE_4KB_SIZE as usize;
/// Usable bytes per overflow page; the tail holds the next-page pointer.
pub const END_OF_PAGE: usize = PAGE_SIZE - std::mem::size_of::<PageIdx>();
/// Hard cap on a single overflow value.
pub const MAX_OVERFLOW_VALUE_SIZE: u64 = BufferPoolConstants::PAGE_256KB_SIZE;

/// Handle to a variable-length value. Two cases, chosen by length: short
/// values are stored inline, long values keep a 4-byte prefix (for cheap
/// comparisons) plus a pointer into the overflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrHandle {
    Inline {
        len: u8,
        bytes: [u8; Self::SHORT_STR_LENGTH],
    },
    Overflow {
        len: u32,
        prefix: [u8; Self::PREFIX_LENGTH],
        page_idx: PageIdx,
        pos_in_page: u32,
    },
}

impl StrHandle {
    pub const SHORT_STR_LENGTH: usize = 12;
    pub const PREFIX_LENGTH: usize = 4;

    pub fn len(&self) -> u64 {
        match self {
            StrHandle::Inline { len, .. } => *len as u64,
            StrHandle::Overflow { len, .. } => *len as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_short(&self) -> bool {
        matches!(self, StrHandle::Inline { .. })
    }

    fn inline(data: &[u8]) -> Self {
        debug_assert!(data.len() <= Self::SHORT_STR_LENGTH);
        let mut bytes = [0u8; Self::SHORT_STR_LENGTH];
        bytes[..data.len()].copy_from_slice(data);
        StrHandle::Inline {
            len: data.len() as u8,
            bytes,
        }
    }

    fn overflow(len: u32, data_prefix: &[u8], cursor: PageCursor) -> Self {
        let mut prefix = [0u8; Self::PREFIX_LENGTH];
        let n = data_prefix.len().min(Self::PREFIX_LENGTH);
        prefix[..n].copy_from_slice(&data_prefix[..n]);
        StrHandle::Overflow {
            len,
            prefix,
            page_idx: cursor.page_idx,
            pos_in_page: cursor.elem_pos_in_page,
        }
    }
}

struct OverflowState {
    next_pos_to_write_to: PageCursor,
    logged_next_byte_pos_record: bool,
}

/// One overflow file, shared by all writers of its owning column/list.
/// Writers serialize on an internal mutex (they all contend for the append
/// cursor); readers go through the buffer manager without locking.
pub struct DiskOverflowFile {
    fh: Arc<BmFileHandle>,
    db_file_id: DbFileId,
    bm: Arc<BufferManager>,
    wal: Arc<Wal>,
    truncate_over_large_values: bool,
    state: Mutex<OverflowState>,
}

impl DiskOverflowFile {
    /// `db_file_id` must already be the overflow variant of the owning
    /// structure's id.
    pub fn new(
        fh: Arc<BmFileHandle>,
        db_file_id: DbFileId,
        bm: Arc<BufferManager>,
        wal: Arc<Wal>,
        truncate_over_large_values: bool,
    ) -> Self {
        let next_byte_pos = fh.num_pages() as u64 * PAGE_SIZE as u64;
        Self {
            fh,
            db_file_id,
            bm,
            wal,
            truncate_over_large_values,
            state: Mutex::new(OverflowState {
                next_pos_to_write_to: PageCursor::for_element(next_byte_pos, PAGE_SIZE as u64),
                logged_next_byte_pos_record: false,
            }),
        }
    }

    pub fn file_handle(&self) -> &Arc<BmFileHandle> {
        &self.fh
    }

    pub fn db_file_id(&self) -> DbFileId {
        self.db_file_id
    }

    pub fn next_byte_pos_to_write_to(&self) -> u64 {
        let state = self.state.lock();
        state.next_pos_to_write_to.page_idx as u64 * PAGE_SIZE as u64
            + state.next_pos_to_write_to.elem_pos_in_page as u64
    }

    /// Rewinds the append cursor; used by WAL rollback to restore the
    /// position checkpointed at the start of the transaction.
    pub fn reset_next_byte_pos_to_write_to(&self, pos: u64) {
        let mut state = self.state.lock();
        state.next_pos_to_write_to = PageCursor::for_element(pos, PAGE_SIZE as u64);
    }

    /// WRITE transactions only: appends `data`, returning its handle. Short
    /// values are returned inline without touching the file.
    pub fn write_value(&self, data: &[u8]) -> Result<StrHandle> {
        if data.len() <= StrHandle::SHORT_STR_LENGTH {
            return Ok(StrHandle::inline(data));
        }
        let mut data = data;
        if data.len() as u64 > MAX_OVERFLOW_VALUE_SIZE {
            if self.truncate_over_large_values {
                data = &data[..MAX_OVERFLOW_VALUE_SIZE as usize];
            } else {
                return Err(DbError::OverLargeValue(data.len() as u64));
            }
        }
        let mut state = self.state.lock();
        self.log_next_byte_pos_record_if_necessary(&mut state)?;
        let start = self.write_overflow(&mut state, data)?;
        Ok(StrHandle::overflow(data.len() as u32, data, start))
    }

    /// Reads the value behind `handle`. For WRITE transactions the read
    /// consults the transaction's WAL shadows.
    pub fn read_value(&self, trx_type: TransactionType, handle: &StrHandle) -> Result<Vec<u8>> {
        let (len, page_idx, pos_in_page) = match handle {
            StrHandle::Inline { len, bytes } => return Ok(bytes[..*len as usize].to_vec()),
            StrHandle::Overflow {
                len,
                page_idx,
                pos_in_page,
                ..
            } => (*len as usize, *page_idx, *pos_in_page),
        };
        let mut result = Vec::with_capacity(len);
        let mut cursor = PageCursor::new(page_idx, pos_in_page);
        let mut remaining = len;
        while remaining > 0 {
            let (fh_to_pin, page_idx_to_pin) = file_handle_and_physical_page_idx_to_pin(
                &self.fh,
                cursor.page_idx,
                &self.wal,
                trx_type,
            );
            let bytes_in_page = remaining.min(END_OF_PAGE - cursor.elem_pos_in_page as usize);
            let start_len = result.len();
            let mut next_page: PageIdx = 0;
            let offset = cursor.elem_pos_in_page as usize;
            self.bm
                .optimistic_read(&fh_to_pin, page_idx_to_pin, |frame| {
                    // The reader may be re-invoked after a raced eviction;
                    // reset before appending.
                    result.truncate(start_len);
                    result.extend_from_slice(&frame[offset..offset + bytes_in_page]);
                    next_page = PageIdx::from_le_bytes(
                        frame[END_OF_PAGE..END_OF_PAGE + 4].try_into().unwrap(),
                    );
                })?;
            remaining -= bytes_in_page;
            cursor = PageCursor::new(next_page, 0);
        }
        Ok(result)
    }

    /// Clears the per-transaction cursor-record flag. Called at the end of
    /// every commit or rollback.
    pub fn reset_logged_next_byte_pos_record(&self) {
        self.state.lock().logged_next_byte_pos_record = false;
    }

    fn log_next_byte_pos_record_if_necessary(&self, state: &mut OverflowState) -> Result<()> {
        if !self.wal.is_enabled() || state.logged_next_byte_pos_record {
            return Ok(());
        }
        state.logged_next_byte_pos_record = true;
        let pos = state.next_pos_to_write_to.page_idx as u64 * PAGE_SIZE as u64
            + state.next_pos_to_write_to.elem_pos_in_page as u64;
        self.wal
            .log_overflow_next_byte_pos_record(self.db_file_id, pos)
    }

    fn write_overflow(&self, state: &mut OverflowState, data: &[u8]) -> Result<PageCursor> {
        // Values that fit on one page are never split across pages.
        if data.len() <= END_OF_PAGE
            && state.next_pos_to_write_to.elem_pos_in_page as usize + data.len() > END_OF_PAGE
        {
            self.start_new_page(state)?;
        }
        let mut start = None;
        let mut written = 0usize;
        while written < data.len() {
            if state.next_pos_to_write_to.elem_pos_in_page as usize >= END_OF_PAGE {
                self.start_new_page(state)?;
            }
            self.ensure_cursor_page_exists(state)?;
            let cursor = state.next_pos_to_write_to;
            if start.is_none() {
                start = Some(cursor);
            }
            let chunk = (data.len() - written).min(END_OF_PAGE - cursor.elem_pos_in_page as usize);
            db_file_utils::update_page(
                &self.fh,
                self.db_file_id,
                cursor.page_idx,
                false,
                &self.bm,
                &self.wal,
                |frame| {
                    let offset = cursor.elem_pos_in_page as usize;
                    frame[offset..offset + chunk].copy_from_slice(&data[written..written + chunk]);
                },
            )?;
            written += chunk;
            state.next_pos_to_write_to.elem_pos_in_page += chunk as u32;
        }
        start.ok_or_else(|| DbError::InvalidArgument("empty overflow payload".to_string()))
    }

    /// Allocates the next overflow page, links it from the tail of the
    /// current page, and moves the cursor to its start.
    fn start_new_page(&self, state: &mut OverflowState) -> Result<()> {
        self.ensure_cursor_page_exists(state)?;
        let current = state.next_pos_to_write_to.page_idx;
        let new_page_idx =
            db_file_utils::insert_new_page(&self.fh, self.db_file_id, &self.bm, &self.wal, |_| {})?;
        db_file_utils::update_page(
            &self.fh,
            self.db_file_id,
            current,
            false,
            &self.bm,
            &self.wal,
            |frame| {
                frame[END_OF_PAGE..END_OF_PAGE + 4].copy_from_slice(&new_page_idx.to_le_bytes());
            },
        )?;
        state.next_pos_to_write_to = PageCursor::new(new_page_idx, 0);
        Ok(())
    }

    fn ensure_cursor_page_exists(&self, state: &mut OverflowState) -> Result<()> {
        if state.next_pos_to_write_to.page_idx >= self.fh.num_pages() {
            let new_page = db_file_utils::insert_new_page(
                &self.fh,
                self.db_file_id,
                &self.bm,
                &self.wal,
                |_| {},
            )?;
            debug_assert_eq!(new_page, state.next_pos_to_write_to.page_idx);
        }
        Ok(())
    }
}

impl Checkpointable for DiskOverflowFile {
    fn prepare_commit(&self) -> Result<()> {
        Ok(())
    }

    fn checkpoint_in_memory(&self) {
        self.reset_logged_next_byte_pos_record();
    }

    fn rollback_in_memory(&self) {
        // The cursor itself is rewound by the WAL replayer from the
        // OVERFLOW_NEXT_BYTE_POS record.
        self.reset_logged_next_byte_pos_record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, SystemConfig};
    use tempfile::tempdir;

    fn test_config() -> SystemConfig {
        SystemConfig {
            buffer_pool_size: BufferPoolConstants::DEFAULT_BUFFER_POOL_SIZE_FOR_TESTING,
            ..SystemConfig::default()
        }
    }

    fn open_db(dir: &std::path::Path, config: SystemConfig) -> (Database, Arc<DiskOverflowFile>) {
        let db = Database::new(dir, config).unwrap();
        let overflow = db.open_overflow_file(DbFileId::column(0, 0)).unwrap();
        (db, overflow)
    }

    #[test]
    fn short_values_stay_inline() -> Result<()> {
        let dir = tempdir().unwrap();
        let (db, overflow) = open_db(dir.path(), test_config());
        let trx = db.begin_write_transaction()?;
        let handle = overflow.write_value(b"hello")?;
        assert!(handle.is_short());
        assert_eq!(handle.len(), 5);
        assert_eq!(
            overflow.read_value(TransactionType::Write, &handle)?,
            b"hello"
        );
        // Nothing was appended to the file.
        assert_eq!(overflow.file_handle().num_pages(), 0);
        db.rollback(trx)?;
        Ok(())
    }

    #[test]
    fn long_value_round_trips_through_commit() -> Result<()> {
        let dir = tempdir().unwrap();
        let (db, overflow) = open_db(dir.path(), test_config());
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let trx = db.begin_write_transaction()?;
        let handle = overflow.write_value(&data)?;
        assert!(!handle.is_short());
        assert_eq!(overflow.read_value(TransactionType::Write, &handle)?, data);
        db.commit(trx)?;
        assert_eq!(
            overflow.read_value(TransactionType::ReadOnly, &handle)?,
            data
        );
        Ok(())
    }

    #[test]
    fn values_that_do_not_fit_move_to_the_next_page() -> Result<()> {
        // Two 3 KiB values cannot share one 4 KiB page.
        let dir = tempdir().unwrap();
        let (db, overflow) = open_db(dir.path(), test_config());
        let first_data = vec![0xaau8; 3 * 1024];
        let second_data = vec![0xbbu8; 3 * 1024];
        let trx = db.begin_write_transaction()?;
        let first = overflow.write_value(&first_data)?;
        let second = overflow.write_value(&second_data)?;
        let (StrHandle::Overflow { page_idx: p1, .. }, StrHandle::Overflow { page_idx: p2, .. }) =
            (first, second)
        else {
            panic!("expected overflow handles");
        };
        assert_ne!(p1, p2);
        db.commit(trx)?;
        assert_eq!(
            overflow.read_value(TransactionType::ReadOnly, &first)?,
            first_data
        );
        assert_eq!(
            overflow.read_value(TransactionType::ReadOnly, &second)?,
            second_data
        );
        Ok(())
    }

    #[test]
    fn page_spanning_value_follows_the_chain() -> Result<()> {
        let dir = tempdir().unwrap();
        let (db, overflow) = open_db(dir.path(), test_config());
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
        let trx = db.begin_write_transaction()?;
        let handle = overflow.write_value(&data)?;
        assert_eq!(overflow.read_value(TransactionType::Write, &handle)?, data);
        db.commit(trx)?;
        assert_eq!(
            overflow.read_value(TransactionType::ReadOnly, &handle)?,
            data
        );
        Ok(())
    }

    #[test]
    fn over_large_value_is_rejected_by_default() -> Result<()> {
        let dir = tempdir().unwrap();
        let (db, overflow) = open_db(dir.path(), test_config());
        let trx = db.begin_write_transaction()?;
        let data = vec![1u8; MAX_OVERFLOW_VALUE_SIZE as usize + 1];
        assert!(matches!(
            overflow.write_value(&data),
            Err(DbError::OverLargeValue(_))
        ));
        db.rollback(trx)?;
        Ok(())
    }

    #[test]
    fn over_large_value_truncates_when_configured() -> Result<()> {
        let dir = tempdir().unwrap();
        let config = SystemConfig {
            truncate_over_large_strings: true,
            ..test_config()
        };
        let (db, overflow) = open_db(dir.path(), config);
        let trx = db.begin_write_transaction()?;
        let data = vec![7u8; MAX_OVERFLOW_VALUE_SIZE as usize + 500];
        let handle = overflow.write_value(&data)?;
        assert_eq!(handle.len(), MAX_OVERFLOW_VALUE_SIZE);
        let read_back = overflow.read_value(TransactionType::Write, &handle)?;
        assert_eq!(read_back.len() as u64, MAX_OVERFLOW_VALUE_SIZE);
        assert!(read_back.iter().all(|&b| b == 7));
        db.commit(trx)?;
        Ok(())
    }

    #[test]
    fn rollback_rewinds_the_append_cursor() -> Result<()> {
        let dir = tempdir().unwrap();
        let (db, overflow) = open_db(dir.path(), test_config());
        let trx = db.begin_write_transaction()?;
        overflow.write_value(&vec![1u8; 100])?;
        db.commit(trx)?;
        let pos_after_commit = overflow.next_byte_pos_to_write_to();

        let trx = db.begin_write_transaction()?;
        overflow.write_value(&vec![2u8; 10_000])?;
        assert_ne!(overflow.next_byte_pos_to_write_to(), pos_after_commit);
        db.rollback(trx)?;
        assert_eq!(overflow.next_byte_pos_to_write_to(), pos_after_commit);
        Ok(())
    }
}
