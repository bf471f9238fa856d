//! Engine-wide constants. The two page-size classes and the page-group
//! granularity are load-bearing: on-disk layouts and the buffer manager's
//! frame addressing both depend on them.

pub struct BufferPoolConstants;

impl BufferPoolConstants {
    pub const PAGE_4KB_SIZE_LOG2: u64 = 12;
    /// Size of the pages backing persistent database files.
    pub const PAGE_4KB_SIZE: u64 = 1 << Self::PAGE_4KB_SIZE_LOG2;
    pub const PAGE_256KB_SIZE_LOG2: u64 = 18;
    /// Size of the pages backing temporary in-memory files.
    pub const PAGE_256KB_SIZE: u64 = 1 << Self::PAGE_256KB_SIZE_LOG2;

    /// When the user does not set a buffer pool size, we take this share of
    /// physical memory.
    pub const DEFAULT_PHY_MEM_SIZE_RATIO_FOR_BM: f64 = 0.8;

    /// Every this many eviction-queue insertions, the queue is purged of
    /// candidates that are no longer evictable.
    pub const EVICTION_QUEUE_PURGING_INTERVAL: u64 = 1024;

    /// Maximum size of the virtual memory region for 4 KiB pages (8 TiB).
    /// Virtual address space only; physical memory is bounded by the pool.
    pub const DEFAULT_VM_REGION_MAX_SIZE: u64 = 1 << 43;

    pub const DEFAULT_BUFFER_POOL_SIZE_FOR_TESTING: u64 = 1 << 26;
}

pub struct StorageConstants;

impl StorageConstants {
    pub const COLUMN_FILE_SUFFIX: &'static str = ".col";
    pub const LISTS_FILE_SUFFIX: &'static str = ".lists";
    pub const INDEX_FILE_SUFFIX: &'static str = ".hindex";
    pub const OVERFLOW_FILE_SUFFIX: &'static str = ".ovf";
    pub const WAL_FILE_SUFFIX: &'static str = ".wal";

    pub const WAL_FILE_NAME: &'static str = "quiver.wal";
    pub const CATALOG_FILE_NAME: &'static str = "catalog.bin";
    pub const CATALOG_FILE_NAME_FOR_WAL: &'static str = "catalog.bin.wal";
    pub const NODES_STATISTICS_AND_DELETED_IDS_FILE_NAME: &'static str =
        "nodes.statistics_and_deleted.ids";
    pub const NODES_STATISTICS_FILE_NAME_FOR_WAL: &'static str =
        "nodes.statistics_and_deleted.ids.wal";
    pub const RELS_STATISTICS_FILE_NAME: &'static str = "rels.statistics";
    pub const RELS_STATISTICS_FILE_NAME_FOR_WAL: &'static str = "rels.statistics.wal";

    /// Pages are grouped in runs of 1024; frame groups are attached to file
    /// handles at this granularity.
    pub const PAGE_GROUP_SIZE_LOG2: u64 = 10;
    pub const PAGE_GROUP_SIZE: u64 = 1 << Self::PAGE_GROUP_SIZE_LOG2;
    pub const PAGE_IDX_IN_GROUP_MASK: u64 = Self::PAGE_GROUP_SIZE - 1;
}

/// How long a committing transaction waits for read transactions to drain
/// before giving up on checkpointing.
pub const DEFAULT_CHECKPOINT_WAIT_TIMEOUT_MICROS: u64 = 5_000_000;
