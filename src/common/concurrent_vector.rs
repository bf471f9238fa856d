//! A grow-only vector of fixed-size chunks with address-stable elements.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

const CHUNK_SIZE: usize = 1024;

/// Concurrent vector used for per-page bookkeeping (page states, frame group
/// indices). Elements are allocated in chunks of 1024 that are never moved or
/// freed until the vector is dropped, so a reference obtained through
/// [`get`](Self::get) stays valid for the vector's whole lifetime. Elements
/// are expected to carry their own interior mutability (atomics); the vector
/// itself only ever appends.
///
/// Shrinking is logical: [`truncate`](Self::truncate) lowers the length but
/// keeps the chunks, and the caller is responsible for resetting any element
/// it later grows back over.
pub struct ConcurrentVector<T> {
    chunks: RwLock<Vec<Box<[T]>>>,
    len: AtomicUsize,
}

impl<T: Default> ConcurrentVector<T> {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the vector to `new_len`, default-initializing new chunks.
    /// Never shrinks.
    pub fn resize(&self, new_len: usize) {
        let mut chunks = self.chunks.write();
        let chunks_needed = new_len.div_ceil(CHUNK_SIZE);
        while chunks.len() < chunks_needed {
            chunks.push((0..CHUNK_SIZE).map(|_| T::default()).collect());
        }
        self.len.fetch_max(new_len, Ordering::Release);
    }

    /// Lowers the logical length. Chunk storage is retained, so elements past
    /// `new_len` keep their last value until the vector grows over them again.
    pub fn truncate(&self, new_len: usize) {
        let _chunks = self.chunks.write();
        self.len.fetch_min(new_len, Ordering::Release);
    }

    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> &T {
        assert!(idx < self.len(), "index {idx} out of bounds");
        let chunks = self.chunks.read();
        let element: *const T = &chunks[idx / CHUNK_SIZE][idx % CHUNK_SIZE];
        // Chunks are append-only and their boxed storage never moves, so the
        // element outlives the chunk-list lock and is valid for &self.
        unsafe { &*element }
    }
}

impl<T: Default> Default for ConcurrentVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn references_stay_stable_across_growth() {
        let v: ConcurrentVector<AtomicU64> = ConcurrentVector::new();
        v.resize(1);
        let first = v.get(0) as *const AtomicU64;
        v.get(0).store(7, Ordering::Relaxed);
        for grow_to in [CHUNK_SIZE, 10 * CHUNK_SIZE] {
            v.resize(grow_to);
            assert_eq!(first, v.get(0) as *const AtomicU64);
        }
        assert_eq!(v.get(0).load(Ordering::Relaxed), 7);
        assert_eq!(v.get(10 * CHUNK_SIZE - 1).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn truncate_keeps_storage() {
        let v: ConcurrentVector<AtomicU64> = ConcurrentVector::new();
        v.resize(CHUNK_SIZE * 2);
        v.get(CHUNK_SIZE).store(42, Ordering::Relaxed);
        v.truncate(CHUNK_SIZE);
        assert_eq!(v.len(), CHUNK_SIZE);
        v.resize(CHUNK_SIZE * 2);
        // The old value survives; callers reset elements they grow back over.
        assert_eq!(v.get(CHUNK_SIZE).load(Ordering::Relaxed), 42);
    }

    #[test]
    fn concurrent_growth_and_reads() {
        let v: Arc<ConcurrentVector<AtomicU64>> = Arc::new(ConcurrentVector::new());
        v.resize(CHUNK_SIZE);
        let grower = {
            let v = Arc::clone(&v);
            std::thread::spawn(move || {
                for i in 2..=64 {
                    v.resize(i * CHUNK_SIZE);
                }
            })
        };
        for _ in 0..10_000 {
            v.get(0).fetch_add(1, Ordering::Relaxed);
        }
        grower.join().unwrap();
        assert_eq!(v.len(), 64 * CHUNK_SIZE);
        assert_eq!(v.get(0).load(Ordering::Relaxed), 10_000);
    }
}
