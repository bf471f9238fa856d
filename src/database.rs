//! The embedding surface: one `Database` object owning the buffer manager,
//! memory manager, WAL, file registry, and transaction manager.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::constants::BufferPoolConstants;
use crate::common::types::PageIdx;
use crate::error::Result;
use crate::storage::buffer_manager::{
    BmFileHandle, BufferManager, FileFlags, MemoryManager, PageSizeClass,
};
use crate::storage::db_file_registry::DbFileRegistry;
use crate::storage::storage_structure::disk_array::{ArrayElement, DiskArray};
use crate::storage::storage_structure::disk_overflow_file::DiskOverflowFile;
use crate::storage::wal::wal::Wal;
use crate::storage::wal::wal_record::DbFileId;
use crate::storage::wal::wal_replayer::{WalReplayer, WalReplayMode};
use crate::transaction::{Transaction, TransactionManager};

/// System-wide configuration. Zero values mean "pick a default": the buffer
/// pool defaults to 80 % of physical memory and the thread hint to the
/// hardware concurrency.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub buffer_pool_size: u64,
    pub max_num_threads: u64,
    /// No files are created and the WAL is skipped; all state lives in
    /// buffer manager frames and is lost on drop.
    pub in_memory_mode: bool,
    /// Over-large overflow values silently shrink instead of raising
    /// `OverLargeValue`. Fixed for the lifetime of the database.
    pub truncate_over_large_strings: bool,
    /// Query timeout of the layer above; the core only sees the resulting
    /// interrupt flag, checked on loop boundaries.
    pub timeout_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            buffer_pool_size: 0,
            max_num_threads: 0,
            in_memory_mode: false,
            truncate_over_large_strings: false,
            timeout_ms: 0,
        }
    }
}

impl SystemConfig {
    fn resolved_buffer_pool_size(&self) -> u64 {
        if self.buffer_pool_size != 0 {
            return self.buffer_pool_size;
        }
        match sys_info::mem_info() {
            Ok(mem) => {
                let total_bytes = mem.total * 1024;
                (total_bytes as f64 * BufferPoolConstants::DEFAULT_PHY_MEM_SIZE_RATIO_FOR_BM) as u64
            }
            Err(_) => BufferPoolConstants::DEFAULT_BUFFER_POOL_SIZE_FOR_TESTING,
        }
    }

    fn resolved_max_num_threads(&self) -> u64 {
        if self.max_num_threads != 0 {
            self.max_num_threads
        } else {
            num_cpus::get() as u64
        }
    }
}

/// An embedded database instance rooted at a directory. Components are
/// constructed in dependency order (buffer manager, memory manager, WAL,
/// registry, transaction manager) and recovery runs before the first
/// transaction can start. The instance must be fully dropped before the
/// directory is reused.
pub struct Database {
    db_dir: PathBuf,
    config: SystemConfig,
    max_num_threads: u64,
    buffer_manager: Arc<BufferManager>,
    memory_manager: MemoryManager,
    wal: Arc<Wal>,
    registry: DbFileRegistry,
    transaction_manager: TransactionManager,
    interrupt_flag: Arc<AtomicBool>,
}

impl Database {
    pub fn new(db_dir: &Path, config: SystemConfig) -> Result<Self> {
        if !config.in_memory_mode {
            std::fs::create_dir_all(db_dir)?;
        }
        let buffer_pool_size = config.resolved_buffer_pool_size();
        let max_num_threads = config.resolved_max_num_threads();
        let buffer_manager = Arc::new(BufferManager::new(buffer_pool_size)?);
        let memory_manager = MemoryManager::new(Arc::clone(&buffer_manager))?;
        let wal = if config.in_memory_mode {
            Arc::new(Wal::disabled(db_dir, Arc::clone(&buffer_manager)))
        } else {
            Arc::new(Wal::new(db_dir, Arc::clone(&buffer_manager))?)
        };
        let registry = DbFileRegistry::new(db_dir);
        let database = Self {
            db_dir: db_dir.to_path_buf(),
            config,
            max_num_threads,
            buffer_manager,
            memory_manager,
            wal,
            registry,
            transaction_manager: TransactionManager::new(),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
        };
        database.recover_if_necessary()?;
        info!(db_dir = %db_dir.display(), buffer_pool_size, "database opened");
        Ok(database)
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn max_num_threads(&self) -> u64 {
        self.max_num_threads
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory_manager
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn registry(&self) -> &DbFileRegistry {
        &self.registry
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.transaction_manager
    }

    /// Poison flag for the layer above's timeout handling; long core loops
    /// check it and bail out with `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupt_flag.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt_flag.store(false, Ordering::SeqCst);
    }

    /// Opens (or creates) the file for `db_file_id` and registers it. The
    /// same handle is returned for repeated calls.
    pub fn open_file(&self, db_file_id: DbFileId) -> Result<Arc<BmFileHandle>> {
        if let Some(fh) = self.registry.file(&db_file_id) {
            return Ok(fh);
        }
        let flags = if self.config.in_memory_mode {
            FileFlags::in_mem_temp(PageSizeClass::Page4Kb)
        } else {
            FileFlags::persistent_create_if_not_exists()
        };
        let fh = self
            .buffer_manager
            .create_file_handle(&self.registry.file_path(&db_file_id), flags)?;
        self.registry.register_file(db_file_id, Arc::clone(&fh));
        Ok(fh)
    }

    /// Opens a disk array stored at `header_page_idx` of the file for
    /// `db_file_id`, registering it for commit/rollback.
    pub fn open_disk_array<T: ArrayElement>(
        &self,
        db_file_id: DbFileId,
        header_page_idx: PageIdx,
        bypass_wal: bool,
    ) -> Result<Arc<DiskArray<T>>> {
        let fh = self.open_file(db_file_id)?;
        let array = Arc::new(DiskArray::<T>::open(
            fh,
            db_file_id,
            header_page_idx,
            Arc::clone(&self.buffer_manager),
            Arc::clone(&self.wal),
            bypass_wal,
        )?);
        self.registry
            .register_structure(Arc::<DiskArray<T>>::clone(&array));
        Ok(array)
    }

    /// Opens the overflow file belonging to `db_file_id` (the owning
    /// structure's id; the overflow variant is derived), registering it for
    /// commit/rollback.
    pub fn open_overflow_file(&self, db_file_id: DbFileId) -> Result<Arc<DiskOverflowFile>> {
        let overflow_id = db_file_id.overflow();
        if let Some(file) = self.registry.overflow_file(&overflow_id) {
            return Ok(file);
        }
        let fh = self.open_file(overflow_id)?;
        let file = Arc::new(DiskOverflowFile::new(
            fh,
            overflow_id,
            Arc::clone(&self.buffer_manager),
            Arc::clone(&self.wal),
            self.config.truncate_over_large_strings,
        ));
        self.registry
            .register_overflow_file(overflow_id, Arc::clone(&file));
        self.registry
            .register_structure(Arc::<DiskOverflowFile>::clone(&file));
        Ok(file)
    }

    pub fn begin_write_transaction(&self) -> Result<Transaction> {
        self.transaction_manager.begin_write_transaction()
    }

    pub fn begin_read_only_transaction(&self) -> Transaction {
        self.transaction_manager.begin_read_only_transaction()
    }

    /// Commits a transaction. For write transactions: prepare, COMMIT
    /// record, flush, quiesce readers, checkpoint, clear the WAL.
    pub fn commit(&self, trx: Transaction) -> Result<()> {
        self.commit_internal(trx, false)
    }

    /// Logs COMMIT and flushes the WAL but skips checkpointing, leaving the
    /// on-disk state as a crash between commit and checkpoint would.
    /// Recovery on the next open completes the checkpoint.
    pub fn commit_but_skip_checkpointing_for_testing(&self, trx: Transaction) -> Result<()> {
        self.commit_internal(trx, true)
    }

    fn commit_internal(&self, trx: Transaction, skip_checkpointing: bool) -> Result<()> {
        if trx.is_read_only() {
            self.transaction_manager.end_transaction(&trx);
            return Ok(());
        }
        let structures = self.registry.structures();
        for structure in &structures {
            structure.prepare_commit()?;
        }
        if !self.wal.is_enabled() {
            // In-memory mode has no durability; just publish the new state.
            for structure in &structures {
                structure.checkpoint_in_memory();
            }
            self.transaction_manager.end_transaction(&trx);
            return Ok(());
        }
        self.wal.log_commit(trx.id())?;
        self.wal.flush_all_pages()?;
        debug!(id = trx.id(), "transaction committed to WAL");
        if skip_checkpointing {
            self.transaction_manager.end_transaction(&trx);
            return Ok(());
        }
        self.transaction_manager
            .wait_until_no_active_read_transactions()?;
        WalReplayer::new(
            &self.wal,
            &self.buffer_manager,
            &self.registry,
            WalReplayMode::CommitCheckpoint,
        )
        .with_interrupt_flag(&self.interrupt_flag)
        .replay()?;
        for structure in &structures {
            structure.checkpoint_in_memory();
        }
        self.registry.clear_all_wal_page_idxs();
        self.wal.clear()?;
        self.transaction_manager.end_transaction(&trx);
        Ok(())
    }

    /// Rolls a transaction back: truncates pages it inserted, rewinds
    /// overflow cursors, discards its shadows and in-memory state.
    pub fn rollback(&self, trx: Transaction) -> Result<()> {
        if trx.is_read_only() {
            self.transaction_manager.end_transaction(&trx);
            return Ok(());
        }
        let structures = self.registry.structures();
        if self.wal.is_enabled() {
            WalReplayer::new(
                &self.wal,
                &self.buffer_manager,
                &self.registry,
                WalReplayMode::Rollback,
            )
            .with_interrupt_flag(&self.interrupt_flag)
            .replay()?;
        }
        for structure in &structures {
            structure.rollback_in_memory();
        }
        self.registry.clear_all_wal_page_idxs();
        if self.wal.is_enabled() {
            self.wal.clear()?;
        }
        self.transaction_manager.end_transaction(&trx);
        Ok(())
    }

    fn recover_if_necessary(&self) -> Result<()> {
        if !self.wal.is_enabled() {
            return Ok(());
        }
        if self.wal.file_handle().file_info().size()? == 0 {
            return Ok(());
        }
        // Decide by the last record on disk: COMMIT means the transaction
        // was durable and the interrupted checkpoint is redone; anything
        // else is discarded.
        let mut iter = self.wal.iterator()?;
        let mut last_record_is_commit = false;
        let mut num_records = 0u64;
        while iter.has_next_record() {
            let record = iter.next_record()?;
            last_record_is_commit =
                matches!(record, crate::storage::wal::wal_record::WalRecord::Commit { .. });
            num_records += 1;
        }
        if num_records == 0 {
            return self.wal.clear();
        }
        let mode = if last_record_is_commit {
            WalReplayMode::RecoveryCheckpoint
        } else {
            WalReplayMode::RecoveryRollback
        };
        info!(?mode, num_records, "recovering WAL");
        WalReplayer::new(&self.wal, &self.buffer_manager, &self.registry, mode).replay()?;
        self.wal.clear()
    }
}
