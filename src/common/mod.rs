pub mod concurrent_vector;
pub mod constants;
pub mod file_utils;
pub mod types;

pub use concurrent_vector::ConcurrentVector;
pub use file_utils::FileInfo;
pub use types::{PageCursor, PageIdx, INVALID_PAGE_IDX};
