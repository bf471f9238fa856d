//! Concurrent buffer manager behavior: optimistic reads racing writers and
//! evictions, and the memory budget under a randomized multi-threaded
//! workload.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quiver_db::common::constants::BufferPoolConstants;
use quiver_db::storage::{BmFileHandle, BufferManager, FileFlags, PageReadPolicy};
use quiver_db::DbError;
use rand::Rng;
use tempfile::tempdir;

const PAGE: usize = BufferPoolConstants::PAGE_4KB_SIZE as usize;

fn new_file(bm: &BufferManager, dir: &Path, pages: u32) -> Arc<BmFileHandle> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let fh = bm
        .create_file_handle(
            &dir.join("data.col"),
            FileFlags::persistent_create_if_not_exists(),
        )
        .unwrap();
    for _ in 0..pages {
        fh.add_new_page().unwrap();
    }
    fh
}

/// Fills page 0 with a known pattern on disk and evicts it from its frame.
fn seed_page_zero(bm: &BufferManager, fh: &Arc<BmFileHandle>, pattern: u8) {
    let mut frame = bm.pin(fh, 0, PageReadPolicy::DontReadPage).unwrap();
    frame.fill(pattern);
    frame.set_dirty();
    drop(frame);
    bm.flush_all_dirty_pages(fh).unwrap();
    bm.remove_file_pages_from_frames(fh);
}

#[test]
fn optimistic_read_under_eviction_pressure_never_tears() {
    // Pool of two pages: thread B's pins keep evicting page 0 while thread
    // A reads it optimistically with a deliberately slow reader.
    let dir = tempdir().unwrap();
    let bm = Arc::new(BufferManager::new(2 * PAGE as u64).unwrap());
    let fh = new_file(&bm, dir.path(), 4);
    seed_page_zero(&bm, &fh, 0xab);

    let stop = Arc::new(AtomicBool::new(false));
    let evictor = {
        let bm = Arc::clone(&bm);
        let fh = Arc::clone(&fh);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut page = 1u32;
            while !stop.load(Ordering::Relaxed) {
                match bm.pin(&fh, page, PageReadPolicy::ReadPage) {
                    Ok(frame) => drop(frame),
                    Err(DbError::BufferManagerOom(_)) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected pin failure: {e}"),
                }
                page = 1 + (page % 3);
            }
        })
    };

    for _ in 0..50 {
        let mut first = vec![0u8; PAGE];
        let mut second = vec![0u8; PAGE];
        // The slow path may find the pool momentarily exhausted; that is a
        // clean failure, not a torn read. Retry until the read lands.
        loop {
            match bm.optimistic_read(&fh, 0, |bytes| {
                first.copy_from_slice(bytes);
                std::thread::sleep(Duration::from_micros(200));
                second.copy_from_slice(bytes);
            }) {
                Ok(()) => break,
                Err(DbError::BufferManagerOom(_)) => std::thread::yield_now(),
                Err(e) => panic!("unexpected read failure: {e}"),
            }
        }
        // The observation that was delivered must be stable and complete:
        // the same bytes on both reads, and the seeded pattern throughout.
        assert_eq!(first, second);
        assert!(first.iter().all(|&b| b == 0xab));
    }
    stop.store(true, Ordering::Relaxed);
    evictor.join().unwrap();
}

#[test]
fn optimistic_read_against_a_writer_sees_whole_versions_only() {
    let dir = tempdir().unwrap();
    let bm = Arc::new(BufferManager::new(64 * PAGE as u64).unwrap());
    let fh = new_file(&bm, dir.path(), 1);
    seed_page_zero(&bm, &fh, 0);

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let bm = Arc::clone(&bm);
        let fh = Arc::clone(&fh);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut value = 0u8;
            while !stop.load(Ordering::Relaxed) {
                value = value.wrapping_add(1);
                let mut frame = bm.pin(&fh, 0, PageReadPolicy::ReadPage).unwrap();
                frame.fill(value);
                frame.set_dirty();
            }
        })
    };

    let mut buf = vec![0u8; PAGE];
    for _ in 0..500 {
        bm.optimistic_read(&fh, 0, |bytes| buf.copy_from_slice(bytes))
            .unwrap();
        let first = buf[0];
        assert!(
            buf.iter().all(|&b| b == first),
            "observed a torn page: {} vs {}",
            first,
            buf.iter().copied().find(|&b| b != first).unwrap()
        );
    }
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn used_memory_stays_within_the_pool_under_random_load() {
    let dir = tempdir().unwrap();
    let pool_pages = 16u64;
    let bm = Arc::new(BufferManager::new(pool_pages * PAGE as u64).unwrap());
    let fh = new_file(&bm, dir.path(), 64);
    let num_threads = 4usize;

    let workers: Vec<_> = (0..num_threads)
        .map(|_| {
            let bm = Arc::clone(&bm);
            let fh = Arc::clone(&fh);
            std::thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..2000 {
                    let page = rng.random_range(0..64u32);
                    match bm.pin(&fh, page, PageReadPolicy::ReadPage) {
                        Ok(mut frame) => {
                            frame[0] = frame[0].wrapping_add(1);
                            frame.set_dirty();
                        }
                        Err(DbError::BufferManagerOom(_)) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected pin failure: {e}"),
                    }
                }
            })
        })
        .collect();

    // While the workload runs, usage may transiently exceed the pool by at
    // most one in-flight reservation per thread.
    let bound = (pool_pages as usize + num_threads) * PAGE;
    for _ in 0..200 {
        assert!(bm.used_memory() as usize <= bound);
        std::thread::sleep(Duration::from_micros(100));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(bm.used_memory() as usize <= bound);
    bm.flush_all_dirty_pages(&fh).unwrap();
    bm.remove_file_pages_from_frames(&fh);
    assert_eq!(bm.used_memory(), 0);
}

#[test]
fn pin_on_a_freshly_created_empty_file_fails_cleanly() {
    let dir = tempdir().unwrap();
    let bm = BufferManager::new(16 * PAGE as u64).unwrap();
    let fh = bm
        .create_file_handle(
            &dir.path().join("fresh.col"),
            FileFlags::persistent_create_if_not_exists(),
        )
        .unwrap();
    assert!(matches!(
        bm.pin(&fh, 0, PageReadPolicy::ReadPage),
        Err(DbError::InvalidArgument(_))
    ));
    // After the first page is added, the pin succeeds.
    fh.add_new_page().unwrap();
    assert!(bm.pin(&fh, 0, PageReadPolicy::ReadPage).is_ok());
}
