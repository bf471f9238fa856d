//! Growth boundaries of the disk array: page-crossing appends, PIP
//! chaining, and the on-disk layout of the header/PIP pages.

use quiver_db::common::constants::BufferPoolConstants;
use quiver_db::common::types::{PageIdx, INVALID_PAGE_IDX};
use quiver_db::storage::DbFileId;
use quiver_db::transaction::TransactionType;
use quiver_db::{Database, SystemConfig};
use tempfile::tempdir;

const PAGE: usize = BufferPoolConstants::PAGE_4KB_SIZE as usize;
const NUM_PAGE_IDXS_PER_PIP: usize = (PAGE - 4) / 4;

fn test_config() -> SystemConfig {
    SystemConfig {
        buffer_pool_size: BufferPoolConstants::DEFAULT_BUFFER_POOL_SIZE_FOR_TESTING,
        ..SystemConfig::default()
    }
}

#[test]
fn appends_cross_array_page_boundaries() {
    // u32 elements: 1024 per page. Elements 1023 and 1024 are the last of
    // the first array page and the first of the second.
    let dir = tempdir().unwrap();
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db
        .open_disk_array::<u32>(DbFileId::column(0, 0), 0, false)
        .unwrap();
    let trx = db.begin_write_transaction().unwrap();
    for i in 0..2048u32 {
        array.push_back(i ^ 0x55aa).unwrap();
    }
    db.commit(trx).unwrap();
    for idx in [0u64, 1023, 1024, 2047] {
        assert_eq!(
            array.get(idx, TransactionType::ReadOnly).unwrap(),
            (idx as u32) ^ 0x55aa
        );
    }
}

/// 64-byte elements pack 64 to a page, so filling one PIP's worth of array
/// pages plus one more (1024 pages, 65 536 elements) must chain a second
/// PIP whose first entry is the array page holding element 1023 * 64.
#[test]
fn growth_across_a_pip_boundary_chains_a_second_pip() {
    let dir = tempdir().unwrap();
    let num_elements: u64 = 64 * 1024;
    {
        let db = Database::new(dir.path(), test_config()).unwrap();
        let array = db
            .open_disk_array::<[u8; 64]>(DbFileId::column(0, 0), 0, false)
            .unwrap();
        let trx = db.begin_write_transaction().unwrap();
        let mut iter = array.iter_mut();
        for i in 0..num_elements {
            let mut value = [0u8; 64];
            value[..8].copy_from_slice(&i.to_le_bytes());
            value[63] = (i % 127) as u8;
            iter.push_back(value).unwrap();
        }
        drop(iter);
        db.commit(trx).unwrap();
    }

    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db
        .open_disk_array::<[u8; 64]>(DbFileId::column(0, 0), 0, false)
        .unwrap();
    assert_eq!(array.num_elements(TransactionType::ReadOnly), num_elements);
    for idx in [
        0u64,
        64_000,
        (NUM_PAGE_IDXS_PER_PIP as u64) * 64, // first element of the second PIP's first page
        num_elements - 1,
    ] {
        let value = array.get(idx, TransactionType::ReadOnly).unwrap();
        assert_eq!(u64::from_le_bytes(value[..8].try_into().unwrap()), idx);
        assert_eq!(value[63], (idx % 127) as u8);
    }

    // Check the on-disk metadata directly: header page 0 points at the
    // first PIP; the first PIP is full and chains to exactly one more.
    let bytes = std::fs::read(db.registry().file_path(&DbFileId::column(0, 0))).unwrap();
    let read_u32 =
        |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as PageIdx;
    let first_pip_page = read_u32(8);
    assert_ne!(first_pip_page, INVALID_PAGE_IDX);
    let first_pip_at = first_pip_page as usize * PAGE;
    let second_pip_page = read_u32(first_pip_at);
    assert_ne!(second_pip_page, INVALID_PAGE_IDX, "first PIP must chain");
    for entry in 0..NUM_PAGE_IDXS_PER_PIP {
        assert_ne!(
            read_u32(first_pip_at + 4 + entry * 4),
            INVALID_PAGE_IDX,
            "first PIP must be full"
        );
    }
    let second_pip_at = second_pip_page as usize * PAGE;
    assert_eq!(
        read_u32(second_pip_at),
        INVALID_PAGE_IDX,
        "second PIP must be the last"
    );
    // 1024 array pages total: the second PIP holds exactly one entry.
    assert_ne!(read_u32(second_pip_at + 4), INVALID_PAGE_IDX);
    assert_eq!(read_u32(second_pip_at + 8), INVALID_PAGE_IDX);
}

#[test]
fn appends_cross_a_page_group_boundary() {
    // Grow the file past 1024 pages so a second frame group is attached.
    let dir = tempdir().unwrap();
    let db = Database::new(dir.path(), test_config()).unwrap();
    let array = db
        .open_disk_array::<[u8; 2048]>(DbFileId::column(0, 0), 0, false)
        .unwrap();
    // 2 elements per page; 1100 pages of data crosses the group boundary
    // in the base file (and far more than that in the WAL file, which also
    // holds a shadow per page).
    let num_elements: u64 = 2200;
    let trx = db.begin_write_transaction().unwrap();
    let mut iter = array.iter_mut();
    for i in 0..num_elements {
        let mut value = [0u8; 2048];
        value[0] = (i % 255) as u8;
        value[2047] = (i % 253) as u8;
        iter.push_back(value).unwrap();
    }
    drop(iter);
    db.commit(trx).unwrap();
    for idx in [0u64, 1023, 1024, num_elements - 1] {
        let value = array.get(idx, TransactionType::ReadOnly).unwrap();
        assert_eq!(value[0], (idx % 255) as u8);
        assert_eq!(value[2047], (idx % 253) as u8);
    }
}
