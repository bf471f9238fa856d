//! Shared shadow-page machinery for transactional storage structures.
//!
//! A WRITE transaction never mutates a base page in place. The first write
//! to a page allocates a shadow page in the WAL file, copies the original
//! bytes in, registers the redirect on the base file handle, and from then
//! on every write (and every read inside the same transaction) goes to the
//! shadow. Commit-checkpoint copies the shadows back into the base files;
//! rollback discards them.
//!
//! When the WAL is disabled (in-memory mode) all of these helpers
//! degenerate to direct writes against the base pages.

use std::sync::Arc;

use crate::common::types::PageIdx;
use crate::error::Result;
use crate::storage::buffer_manager::{
    BmFileHandle, BufferManager, PageReadPolicy, WalPageIdxLockGuard,
};
use crate::storage::wal::wal::Wal;
use crate::storage::wal::wal_record::DbFileId;
use crate::transaction::TransactionType;

/// A pinned, writable view of the page a transactional update must touch:
/// the WAL shadow when the WAL is enabled, the base page otherwise. Holds
/// the base page's redirect lock (if any) and the pin; both release on drop,
/// on every exit path.
pub struct ShadowPageAndFrame<'a> {
    pub original_page_idx: PageIdx,
    pub page_idx_in_wal: PageIdx,
    bm: &'a BufferManager,
    pinned_fh: Arc<BmFileHandle>,
    frame: *mut u8,
    page_size: usize,
    _redirect_lock: Option<WalPageIdxLockGuard>,
}

impl std::ops::Deref for ShadowPageAndFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.frame, self.page_size) }
    }
}

impl std::ops::DerefMut for ShadowPageAndFrame<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.frame, self.page_size) }
    }
}

impl Drop for ShadowPageAndFrame<'_> {
    fn drop(&mut self) {
        self.bm.unpin(&self.pinned_fh, self.page_idx_in_wal);
    }
}

/// Resolves where a read of `page_idx` must go: the base file for read
/// transactions and unshadowed pages, the WAL file for pages the running
/// write transaction has shadowed.
pub fn file_handle_and_physical_page_idx_to_pin(
    fh: &Arc<BmFileHandle>,
    page_idx: PageIdx,
    wal: &Wal,
    trx_type: TransactionType,
) -> (Arc<BmFileHandle>, PageIdx) {
    if !wal.is_enabled() || trx_type == TransactionType::ReadOnly {
        return (Arc::clone(fh), page_idx);
    }
    match fh.get_wal_page_idx_no_lock(page_idx) {
        Some(wal_idx) => (Arc::clone(wal.file_handle()), wal_idx),
        None => (Arc::clone(fh), page_idx),
    }
}

/// Pins the writable version of `original_page_idx`, creating the WAL
/// shadow (and its PAGE_SHADOW record) if this is the transaction's first
/// write to that page. `inserting_new_page` skips copying the original
/// bytes for base pages that did not exist before this transaction.
pub fn create_shadow_version_if_necessary_and_pin_page<'a>(
    original_page_idx: PageIdx,
    inserting_new_page: bool,
    fh: &Arc<BmFileHandle>,
    db_file_id: DbFileId,
    bm: &'a BufferManager,
    wal: &Wal,
) -> Result<ShadowPageAndFrame<'a>> {
    if !wal.is_enabled() {
        return pin_page_direct(original_page_idx, inserting_new_page, fh, bm);
    }
    fh.add_wal_page_idx_group_if_necessary(original_page_idx);
    let redirect_lock = fh.acquire_wal_page_idx_lock(original_page_idx);
    let wal_fh = wal.file_handle();
    let (page_idx_in_wal, frame) = match fh.get_wal_page_idx_no_lock(original_page_idx) {
        Some(existing) => {
            let frame = bm.pin_raw(wal_fh, existing, PageReadPolicy::ReadPage)?;
            (existing, frame)
        }
        None => {
            let page_idx_in_wal = wal.log_page_shadow_record(db_file_id, original_page_idx)?;
            let frame = bm.pin_raw(wal_fh, page_idx_in_wal, PageReadPolicy::DontReadPage)?;
            unsafe { std::ptr::write_bytes(frame, 0, fh.page_size() as usize) };
            if !inserting_new_page {
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(frame, fh.page_size() as usize)
                };
                if let Err(e) =
                    bm.optimistic_read(fh, original_page_idx, |src| dst.copy_from_slice(src))
                {
                    bm.unpin(wal_fh, page_idx_in_wal);
                    return Err(e);
                }
            }
            fh.set_wal_page_idx_no_lock(original_page_idx, page_idx_in_wal);
            wal_fh.set_locked_page_dirty(page_idx_in_wal);
            (page_idx_in_wal, frame)
        }
    };
    Ok(ShadowPageAndFrame {
        original_page_idx,
        page_idx_in_wal,
        bm,
        pinned_fh: Arc::clone(wal_fh),
        frame,
        page_size: fh.page_size() as usize,
        _redirect_lock: Some(redirect_lock),
    })
}

/// Direct-write view of a base page, used when the WAL is bypassed (pages
/// new to the transaction, or in-memory mode).
pub fn pin_page_direct<'a>(
    page_idx: PageIdx,
    is_new_page: bool,
    fh: &Arc<BmFileHandle>,
    bm: &'a BufferManager,
) -> Result<ShadowPageAndFrame<'a>> {
    let policy = if is_new_page {
        PageReadPolicy::DontReadPage
    } else {
        PageReadPolicy::ReadPage
    };
    let frame = bm.pin_raw(fh, page_idx, policy)?;
    if is_new_page {
        unsafe { std::ptr::write_bytes(frame, 0, fh.page_size() as usize) };
    }
    fh.set_locked_page_dirty(page_idx);
    Ok(ShadowPageAndFrame {
        original_page_idx: page_idx,
        page_idx_in_wal: page_idx,
        bm,
        pinned_fh: Arc::clone(fh),
        frame,
        page_size: fh.page_size() as usize,
        _redirect_lock: None,
    })
}

/// Appends a page to the base file and immediately shadows it, logging a
/// PAGE_INSERT record. `insert_op` runs against the zeroed shadow frame.
/// Returns the new page's index in the base file.
pub fn insert_new_page(
    fh: &Arc<BmFileHandle>,
    db_file_id: DbFileId,
    bm: &BufferManager,
    wal: &Wal,
    insert_op: impl FnOnce(&mut [u8]),
) -> Result<PageIdx> {
    let new_original_page_idx = fh.add_new_page()?;
    if !wal.is_enabled() {
        let mut guard = pin_page_direct(new_original_page_idx, true, fh, bm)?;
        insert_op(&mut guard);
        return Ok(new_original_page_idx);
    }
    let wal_fh = wal.file_handle();
    let page_idx_in_wal = wal.log_page_insert_record(db_file_id, new_original_page_idx)?;
    let frame = bm.pin_raw(wal_fh, page_idx_in_wal, PageReadPolicy::DontReadPage)?;
    unsafe { std::ptr::write_bytes(frame, 0, fh.page_size() as usize) };
    fh.add_wal_page_idx_group_if_necessary(new_original_page_idx);
    fh.set_wal_page_idx(new_original_page_idx, page_idx_in_wal);
    let bytes = unsafe { std::slice::from_raw_parts_mut(frame, fh.page_size() as usize) };
    insert_op(bytes);
    wal_fh.set_locked_page_dirty(page_idx_in_wal);
    bm.unpin(wal_fh, page_idx_in_wal);
    Ok(new_original_page_idx)
}

/// Transactionally updates a page: the write lands in the WAL shadow and
/// becomes visible to readers only after commit-checkpoint.
pub fn update_page(
    fh: &Arc<BmFileHandle>,
    db_file_id: DbFileId,
    original_page_idx: PageIdx,
    inserting_new_page: bool,
    bm: &BufferManager,
    wal: &Wal,
    update_op: impl FnOnce(&mut [u8]),
) -> Result<()> {
    let mut guard = create_shadow_version_if_necessary_and_pin_page(
        original_page_idx,
        inserting_new_page,
        fh,
        db_file_id,
        bm,
        wal,
    )?;
    update_op(&mut guard);
    Ok(())
}
