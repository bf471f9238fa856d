//! Crash-recovery scenarios: a database is written, "crashed" (dropped
//! without checkpointing), and reopened; recovery must either discard or
//! complete the interrupted transaction based on the WAL's last record.

use quiver_db::common::constants::BufferPoolConstants;
use quiver_db::storage::DbFileId;
use quiver_db::transaction::TransactionType;
use quiver_db::{Database, SystemConfig};
use tempfile::tempdir;

const PAGE: u64 = BufferPoolConstants::PAGE_4KB_SIZE;

fn test_config() -> SystemConfig {
    SystemConfig {
        buffer_pool_size: BufferPoolConstants::DEFAULT_BUFFER_POOL_SIZE_FOR_TESTING,
        ..SystemConfig::default()
    }
}

fn array_file_id() -> DbFileId {
    DbFileId::column(1, 0)
}

/// Creates the database with a six-element array, all values 42, committed.
fn seed_database(dir: &std::path::Path) {
    let db = Database::new(dir, test_config()).unwrap();
    let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    let trx = db.begin_write_transaction().unwrap();
    array.resize(6, 42).unwrap();
    db.commit(trx).unwrap();
}

#[test]
fn uncommitted_transaction_is_discarded_on_reopen() {
    let dir = tempdir().unwrap();
    seed_database(dir.path());
    {
        let db = Database::new(dir.path(), test_config()).unwrap();
        let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
        let trx = db.begin_write_transaction().unwrap();
        array.update(5, 99).unwrap();
        assert_eq!(array.get(5, TransactionType::Write).unwrap(), 99);
        // Force the uncommitted shadow records onto disk, then crash
        // with the transaction still open.
        db.wal().flush_all_pages().unwrap();
        drop(trx);
    }
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    assert_eq!(array.get(5, TransactionType::ReadOnly).unwrap(), 42);
    assert_eq!(
        std::fs::metadata(db.wal().path()).unwrap().len(),
        0,
        "recovery must leave the WAL empty"
    );
}

#[test]
fn unflushed_uncommitted_transaction_leaves_no_trace() {
    let dir = tempdir().unwrap();
    seed_database(dir.path());
    {
        let db = Database::new(dir.path(), test_config()).unwrap();
        let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
        let trx = db.begin_write_transaction().unwrap();
        array.update(5, 99).unwrap();
        // Crash without any WAL flush: nothing of the transaction reached
        // disk at all.
        drop(trx);
    }
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    assert_eq!(array.get(5, TransactionType::ReadOnly).unwrap(), 42);
    assert_eq!(std::fs::metadata(db.wal().path()).unwrap().len(), 0);
}

#[test]
fn committed_transaction_is_replayed_on_reopen() {
    let dir = tempdir().unwrap();
    seed_database(dir.path());
    {
        let db = Database::new(dir.path(), test_config()).unwrap();
        let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
        let trx = db.begin_write_transaction().unwrap();
        array.update(5, 99).unwrap();
        // COMMIT reaches the WAL, the checkpoint does not happen: the
        // crash window between commit and checkpoint.
        db.commit_but_skip_checkpointing_for_testing(trx).unwrap();
    }
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    assert_eq!(array.get(5, TransactionType::ReadOnly).unwrap(), 99);
    assert_eq!(std::fs::metadata(db.wal().path()).unwrap().len(), 0);

    // The base file itself must hold the new bytes: element 5 sits on the
    // first array page (page 1; page 0 is the array header).
    let data_path = db.registry().file_path(&array_file_id());
    let bytes = std::fs::read(&data_path).unwrap();
    let offset = (PAGE + 5 * 8) as usize;
    let value = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
    assert_eq!(value, 99);
}

#[test]
fn committed_appends_survive_reopen() {
    let dir = tempdir().unwrap();
    let values: Vec<u64> = (0..3000).map(|i| i * 3 + 1).collect();
    {
        let db = Database::new(dir.path(), test_config()).unwrap();
        let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
        let trx = db.begin_write_transaction().unwrap();
        for &v in &values {
            array.push_back(v).unwrap();
        }
        db.commit(trx).unwrap();
    }
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    assert_eq!(
        array.num_elements(TransactionType::ReadOnly),
        values.len() as u64
    );
    for (i, &v) in values.iter().enumerate() {
        assert_eq!(array.get(i as u64, TransactionType::ReadOnly).unwrap(), v);
    }
}

#[test]
fn rollback_restores_files_byte_for_byte() {
    let dir = tempdir().unwrap();
    seed_database(dir.path());
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    let overflow = db.open_overflow_file(array_file_id()).unwrap();
    {
        let trx = db.begin_write_transaction().unwrap();
        overflow.write_value(&vec![9u8; 5000]).unwrap();
        db.commit(trx).unwrap();
    }
    let data_path = db.registry().file_path(&array_file_id());
    let overflow_path = db.registry().file_path(&array_file_id().overflow());
    let data_before = std::fs::read(&data_path).unwrap();
    let overflow_before = std::fs::read(&overflow_path).unwrap();

    let trx = db.begin_write_transaction().unwrap();
    array.update(0, 1234).unwrap();
    for i in 0..2000u64 {
        array.push_back(i).unwrap();
    }
    overflow.write_value(&vec![7u8; 20_000]).unwrap();
    db.rollback(trx).unwrap();

    assert_eq!(std::fs::read(&data_path).unwrap(), data_before);
    assert_eq!(std::fs::read(&overflow_path).unwrap(), overflow_before);
    assert_eq!(array.get(0, TransactionType::ReadOnly).unwrap(), 42);
}

#[test]
fn no_op_commit_leaves_base_files_bit_identical() {
    let dir = tempdir().unwrap();
    seed_database(dir.path());
    let db = Database::new(dir.path(), test_config()).unwrap();
    let _array = db.open_disk_array::<u64>(array_file_id(), 0, false).unwrap();
    let data_path = db.registry().file_path(&array_file_id());
    let before = std::fs::read(&data_path).unwrap();
    let trx = db.begin_write_transaction().unwrap();
    db.commit(trx).unwrap();
    assert_eq!(std::fs::read(&data_path).unwrap(), before);
    assert_eq!(std::fs::metadata(db.wal().path()).unwrap().len(), 0);
}

#[test]
fn overflow_values_survive_commit_and_reopen() {
    // Two 3 KiB values: the second must start on a fresh page, and both
    // must read back after checkpoint and reopen.
    let dir = tempdir().unwrap();
    let first_data = vec![0x5au8; 3 * 1024];
    let second_data = vec![0xa5u8; 3 * 1024];
    let (first, second) = {
        let db = Database::new(dir.path(), test_config()).unwrap();
        let overflow = db.open_overflow_file(array_file_id()).unwrap();
        let trx = db.begin_write_transaction().unwrap();
        let first = overflow.write_value(&first_data).unwrap();
        let second = overflow.write_value(&second_data).unwrap();
        db.commit(trx).unwrap();
        (first, second)
    };
    let db = Database::new(dir.path(), test_config()).unwrap();
    let overflow = db.open_overflow_file(array_file_id()).unwrap();
    assert_eq!(
        overflow
            .read_value(TransactionType::ReadOnly, &first)
            .unwrap(),
        first_data
    );
    assert_eq!(
        overflow
            .read_value(TransactionType::ReadOnly, &second)
            .unwrap(),
        second_data
    );
}
