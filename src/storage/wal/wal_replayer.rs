//! Replays the WAL against the base files: commit-checkpoint, rollback, and
//! crash recovery.
//!
//! Checkpointing copies every shadow page recorded up to the last COMMIT
//! into its base file; rollback instead truncates base files back past any
//! pages the transaction inserted and rewinds overflow cursors. Recovery
//! runs one of the two against a WAL left behind by a crashed process,
//! resolving files by path since no live handles exist yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::types::PageIdx;
use crate::common::FileInfo;
use crate::error::{DbError, Result};
use crate::storage::buffer_manager::BufferManager;
use crate::storage::db_file_registry::DbFileRegistry;
use crate::storage::wal::wal::Wal;
use crate::storage::wal::wal_record::{DbFileId, WalRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalReplayMode {
    /// Publish a just-committed transaction: copy shadows into base files.
    CommitCheckpoint,
    /// Abandon the running transaction: truncate inserted pages, rewind
    /// overflow cursors.
    Rollback,
    /// Recovery of a WAL whose last record is COMMIT.
    RecoveryCheckpoint,
    /// Recovery of a WAL that ends mid-transaction.
    RecoveryRollback,
}

impl WalReplayMode {
    fn is_checkpoint(self) -> bool {
        matches!(
            self,
            WalReplayMode::CommitCheckpoint | WalReplayMode::RecoveryCheckpoint
        )
    }

    fn is_recovering(self) -> bool {
        matches!(
            self,
            WalReplayMode::RecoveryCheckpoint | WalReplayMode::RecoveryRollback
        )
    }
}

pub struct WalReplayer<'a> {
    wal: &'a Wal,
    bm: &'a Arc<BufferManager>,
    registry: &'a DbFileRegistry,
    mode: WalReplayMode,
    interrupt: Option<&'a AtomicBool>,
    // Recovery resolves files by derived path; opened handles are cached
    // across records.
    recovery_files: HashMap<DbFileId, FileInfo>,
}

impl<'a> WalReplayer<'a> {
    pub fn new(
        wal: &'a Wal,
        bm: &'a Arc<BufferManager>,
        registry: &'a DbFileRegistry,
        mode: WalReplayMode,
    ) -> Self {
        Self {
            wal,
            bm,
            registry,
            mode,
            interrupt: None,
            recovery_files: HashMap::new(),
        }
    }

    pub fn with_interrupt_flag(mut self, interrupt: &'a AtomicBool) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn replay(&mut self) -> Result<()> {
        if !self.wal.is_enabled() {
            return Ok(());
        }
        let wal_fh = self.wal.file_handle();
        if wal_fh.num_pages() == 0 || wal_fh.file_info().size()? == 0 {
            return Ok(());
        }
        let mut records = Vec::new();
        let mut iter = self.wal.iterator()?;
        while iter.has_next_record() {
            records.push(iter.next_record()?);
        }
        // Checkpoint replays stop at the last COMMIT; anything after it
        // belongs to a transaction that never became durable.
        let replay_until = if self.mode.is_checkpoint() {
            match records
                .iter()
                .rposition(|r| matches!(r, WalRecord::Commit { .. }))
            {
                Some(last_commit) => last_commit + 1,
                None => 0,
            }
        } else {
            records.len()
        };
        debug!(
            mode = ?self.mode,
            num_records = records.len(),
            replay_until,
            "replaying WAL"
        );
        let mut first_inserted_page: HashMap<DbFileId, PageIdx> = HashMap::new();
        for record in &records[..replay_until] {
            if let Some(interrupt) = self.interrupt {
                if interrupt.load(Ordering::Relaxed) {
                    return Err(DbError::Interrupted);
                }
            }
            self.replay_record(record, &mut first_inserted_page)?;
        }
        if !self.mode.is_checkpoint() {
            for (db_file_id, first_page_idx) in first_inserted_page {
                self.truncate_inserted_pages(&db_file_id, first_page_idx)?;
            }
        }
        Ok(())
    }

    fn replay_record(
        &mut self,
        record: &WalRecord,
        first_inserted_page: &mut HashMap<DbFileId, PageIdx>,
    ) -> Result<()> {
        match *record {
            WalRecord::PageShadow {
                db_file_id,
                original_page_idx,
                page_idx_in_wal,
            }
            | WalRecord::PageInsert {
                db_file_id,
                original_page_idx,
                page_idx_in_wal,
            } => {
                if self.mode.is_checkpoint() {
                    self.copy_shadow_to_base_file(db_file_id, original_page_idx, page_idx_in_wal)
                } else {
                    if matches!(record, WalRecord::PageInsert { .. }) {
                        first_inserted_page
                            .entry(db_file_id)
                            .and_modify(|first| *first = (*first).min(original_page_idx))
                            .or_insert(original_page_idx);
                    }
                    Ok(())
                }
            }
            WalRecord::OverflowNextBytePos { db_file_id, pos } => {
                // Only a discarded transaction rewinds the cursor; a
                // committed one keeps its advanced position. Recovery
                // recomputes cursors from file sizes after truncation.
                if !self.mode.is_checkpoint() && !self.mode.is_recovering() {
                    match self.registry.overflow_file(&db_file_id) {
                        Some(overflow_file) => {
                            overflow_file.reset_next_byte_pos_to_write_to(pos);
                        }
                        None => warn!(
                            ?db_file_id,
                            "overflow cursor record for an unregistered file"
                        ),
                    }
                }
                Ok(())
            }
            WalRecord::Commit { .. } => Ok(()),
        }
    }

    fn copy_shadow_to_base_file(
        &mut self,
        db_file_id: DbFileId,
        original_page_idx: PageIdx,
        page_idx_in_wal: PageIdx,
    ) -> Result<()> {
        let wal_fh = self.wal.file_handle();
        let page_size = wal_fh.page_size() as usize;
        let mut page = vec![0u8; page_size];
        wal_fh.read_page(&mut page, page_idx_in_wal)?;
        if self.mode.is_recovering() {
            let file = self.recovery_file(db_file_id)?;
            file.write_to_file(&page, original_page_idx as u64 * page_size as u64)?;
            return Ok(());
        }
        let fh = self.registry.file(&db_file_id).ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "checkpoint found a WAL record for an unregistered file: {db_file_id:?}"
            ))
        })?;
        fh.write_page(&page, original_page_idx)?;
        self.bm
            .update_frame_if_page_is_in_frame(&fh, &page, original_page_idx);
        fh.clear_wal_page_idx_if_necessary(original_page_idx);
        Ok(())
    }

    fn truncate_inserted_pages(
        &mut self,
        db_file_id: &DbFileId,
        first_page_idx: PageIdx,
    ) -> Result<()> {
        if self.mode.is_recovering() {
            let page_size = self.wal.file_handle().page_size();
            let file = self.recovery_file(*db_file_id)?;
            let new_len = first_page_idx as u64 * page_size;
            if file.size()? > new_len {
                file.truncate(new_len)?;
            }
            return Ok(());
        }
        let fh = self.registry.file(db_file_id).ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "rollback found inserted pages of an unregistered file: {db_file_id:?}"
            ))
        })?;
        for page_idx in first_page_idx..fh.num_pages() {
            self.bm.remove_page_from_frame_if_necessary(&fh, page_idx);
            fh.clear_wal_page_idx_if_necessary(page_idx);
        }
        fh.remove_page_idxs_and_truncate_if_necessary(first_page_idx);
        let new_len = first_page_idx as u64 * fh.page_size();
        if fh.file_info().size()? > new_len {
            fh.file_info().truncate(new_len)?;
        }
        Ok(())
    }

    fn recovery_file(&mut self, db_file_id: DbFileId) -> Result<&FileInfo> {
        if !self.recovery_files.contains_key(&db_file_id) {
            let path = self.registry.file_path(&db_file_id);
            let file = FileInfo::open(&path, true, false)?;
            self.recovery_files.insert(db_file_id, file);
        }
        Ok(&self.recovery_files[&db_file_id])
    }
}
