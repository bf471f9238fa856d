//! Registry of the database files and storage structures participating in
//! transactions. The WAL replayer resolves `DbFileId`s through it during
//! live checkpoints and rollbacks; structure-level checkpoint hooks run
//! through it at commit time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::buffer_manager::BmFileHandle;
use crate::storage::storage_structure::disk_overflow_file::DiskOverflowFile;
use crate::storage::storage_utils;
use crate::storage::wal::wal_record::DbFileId;

/// A storage structure that participates in commit/rollback. The calls
/// mirror the transaction protocol: `prepare_commit` persists in-memory
/// bookkeeping into WAL shadows before the COMMIT record is written;
/// `checkpoint_in_memory`/`rollback_in_memory` publish or discard the write
/// transaction's view after the WAL replay.
pub trait Checkpointable: Send + Sync {
    fn prepare_commit(&self) -> Result<()>;
    fn checkpoint_in_memory(&self);
    fn rollback_in_memory(&self);
}

pub struct DbFileRegistry {
    db_dir: PathBuf,
    files: DashMap<DbFileId, Arc<BmFileHandle>>,
    overflow_files: DashMap<DbFileId, Arc<DiskOverflowFile>>,
    structures: Mutex<Vec<Arc<dyn Checkpointable>>>,
}

impl DbFileRegistry {
    pub fn new(db_dir: &Path) -> Self {
        Self {
            db_dir: db_dir.to_path_buf(),
            files: DashMap::new(),
            overflow_files: DashMap::new(),
            structures: Mutex::new(Vec::new()),
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn file_path(&self, db_file_id: &DbFileId) -> PathBuf {
        storage_utils::db_file_path(&self.db_dir, db_file_id)
    }

    pub fn register_file(&self, db_file_id: DbFileId, fh: Arc<BmFileHandle>) {
        self.files.insert(db_file_id, fh);
    }

    pub fn register_overflow_file(&self, db_file_id: DbFileId, file: Arc<DiskOverflowFile>) {
        self.overflow_files.insert(db_file_id, file);
    }

    pub fn register_structure(&self, structure: Arc<dyn Checkpointable>) {
        self.structures.lock().push(structure);
    }

    pub fn file(&self, db_file_id: &DbFileId) -> Option<Arc<BmFileHandle>> {
        self.files.get(db_file_id).map(|fh| Arc::clone(&fh))
    }

    pub fn overflow_file(&self, db_file_id: &DbFileId) -> Option<Arc<DiskOverflowFile>> {
        self.overflow_files.get(db_file_id).map(|f| Arc::clone(&f))
    }

    pub fn structures(&self) -> Vec<Arc<dyn Checkpointable>> {
        self.structures.lock().clone()
    }

    /// Drops every WAL redirect on every registered file (end of a write
    /// transaction, after replay).
    pub fn clear_all_wal_page_idxs(&self) {
        for entry in self.files.iter() {
            entry.value().clear_all_wal_page_idxs();
        }
        for entry in self.overflow_files.iter() {
            entry.value().file_handle().clear_all_wal_page_idxs();
        }
    }
}
