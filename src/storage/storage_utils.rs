//! Mapping from logical file ids to paths inside the database directory.

use std::path::{Path, PathBuf};

use crate::common::constants::StorageConstants;
use crate::storage::wal::wal_record::{DbFileId, StructureId};

/// Derives the on-disk path of a database file from its id. The naming is
/// stable: recovery uses it to reopen files without a catalog.
pub fn db_file_path(db_dir: &Path, db_file_id: &DbFileId) -> PathBuf {
    let base = match db_file_id.structure {
        StructureId::Column {
            table_id,
            property_id,
        } => format!(
            "t-{table_id}-p-{property_id}{}",
            StorageConstants::COLUMN_FILE_SUFFIX
        ),
        StructureId::Lists {
            table_id,
            property_id,
        } => format!(
            "t-{table_id}-p-{property_id}{}",
            StorageConstants::LISTS_FILE_SUFFIX
        ),
        StructureId::Index { table_id } => {
            format!("t-{table_id}{}", StorageConstants::INDEX_FILE_SUFFIX)
        }
    };
    if db_file_id.is_overflow {
        db_dir.join(overflow_file_name(&base))
    } else {
        db_dir.join(base)
    }
}

/// `foo.col` -> `foo.col.ovf`.
pub fn overflow_file_name(file_name: &str) -> String {
    format!("{file_name}{}", StorageConstants::OVERFLOW_FILE_SUFFIX)
}

pub fn wal_file_path(db_dir: &Path) -> PathBuf {
    db_dir.join(StorageConstants::WAL_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable_and_distinct() {
        let dir = Path::new("/db");
        let column = db_file_path(dir, &DbFileId::column(2, 4));
        let overflow = db_file_path(dir, &DbFileId::column(2, 4).overflow());
        let index = db_file_path(dir, &DbFileId::index(2));
        assert_eq!(column, Path::new("/db/t-2-p-4.col"));
        assert_eq!(overflow, Path::new("/db/t-2-p-4.col.ovf"));
        assert_eq!(index, Path::new("/db/t-2.hindex"));
    }
}
