pub mod buffer_manager;
pub mod db_file_registry;
pub mod storage_structure;
pub mod storage_utils;
pub mod wal;

pub use buffer_manager::{
    BmFileHandle, BufferManager, FileFlags, MemoryBuffer, MemoryManager, PageReadPolicy,
    PageSizeClass, PinnedFrame,
};
pub use db_file_registry::{Checkpointable, DbFileRegistry};
pub use storage_structure::disk_array::{ArrayElement, DiskArray, WriteIterator};
pub use storage_structure::disk_overflow_file::{DiskOverflowFile, StrHandle};
pub use wal::wal::Wal;
pub use wal::wal_record::{DbFileId, StructureId, WalRecord};
pub use wal::wal_replayer::{WalReplayMode, WalReplayer};
