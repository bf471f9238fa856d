//! Per-page state words: lock, version counter, and dirty flag in one
//! atomic u64.

use std::sync::atomic::{AtomicU64, Ordering};

/// State of one page of a file, packed into a single atomic word:
///
/// - bits 0..8: state (`UNLOCKED`, `LOCKED`, `MARKED`, `EVICTED`),
/// - bits 8..56: version counter, incremented on every unlock and eviction,
/// - bit 63: dirty flag.
///
/// Only a thread that moved the state to `LOCKED` may mutate the page's
/// frame bytes or the dirty flag. `EVICTED` means no frame currently backs
/// the page. `MARKED` is the eviction clock's second-chance hint: an
/// unpinned page is marked on its first trip through the eviction queue and
/// only evicted on the second, unless a reader clears the mark first.
pub struct PageState {
    state_and_version: AtomicU64,
}

const STATE_MASK: u64 = 0xff;
const VERSION_MASK: u64 = 0x00ff_ffff_ffff_ff00;
const VERSION_INCREMENT: u64 = 1 << 8;
const DIRTY_MASK: u64 = 0x8000_0000_0000_0000;

impl PageState {
    pub const UNLOCKED: u64 = 0;
    pub const LOCKED: u64 = 1;
    pub const MARKED: u64 = 2;
    pub const EVICTED: u64 = 3;

    pub fn state_of(state_and_version: u64) -> u64 {
        state_and_version & STATE_MASK
    }

    pub fn version_of(state_and_version: u64) -> u64 {
        state_and_version & VERSION_MASK
    }

    /// Same version and dirty flag, new state.
    fn with_state(state_and_version: u64, new_state: u64) -> u64 {
        (state_and_version & !STATE_MASK) | new_state
    }

    /// Bumps the version, keeps the dirty flag, sets the new state.
    fn with_state_and_incremented_version(state_and_version: u64, new_state: u64) -> u64 {
        let version = (state_and_version & VERSION_MASK).wrapping_add(VERSION_INCREMENT)
            & VERSION_MASK;
        (state_and_version & DIRTY_MASK) | version | new_state
    }

    pub fn load(&self) -> u64 {
        self.state_and_version.load(Ordering::SeqCst)
    }

    /// Attempts UNLOCKED/MARKED/EVICTED -> LOCKED against the exact word the
    /// caller last observed. Fails if anything about the word changed.
    pub fn try_lock(&self, expected: u64) -> bool {
        self.state_and_version
            .compare_exchange(
                expected,
                Self::with_state(expected, Self::LOCKED),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// LOCKED -> UNLOCKED, incrementing the version. The caller must hold
    /// the page locked; this is not checked (concurrent unlock of a page
    /// you do not hold corrupts the state word).
    pub fn unlock(&self) {
        let current = self.load();
        self.state_and_version.store(
            Self::with_state_and_incremented_version(current, Self::UNLOCKED),
            Ordering::SeqCst,
        );
    }

    /// Restores an EVICTED word after a failed frame claim, keeping the
    /// version the caller locked at.
    pub fn restore_to_evicted(&self) {
        let current = self.load();
        self.state_and_version
            .store(Self::with_state(current, Self::EVICTED), Ordering::SeqCst);
    }

    /// UNLOCKED -> MARKED (eviction second chance).
    pub fn try_mark(&self, expected: u64) -> bool {
        self.state_and_version
            .compare_exchange(
                expected,
                Self::with_state(expected, Self::MARKED),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// MARKED -> UNLOCKED, same version (the page was touched again).
    pub fn try_clear_mark(&self, expected: u64) -> bool {
        debug_assert_eq!(Self::state_of(expected), Self::MARKED);
        self.state_and_version
            .compare_exchange(
                expected,
                Self::with_state(expected, Self::UNLOCKED),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Requires the page to be LOCKED by the caller.
    pub fn set_dirty(&self) {
        self.state_and_version.fetch_or(DIRTY_MASK, Ordering::SeqCst);
    }

    /// Requires the page to be LOCKED by the caller.
    pub fn clear_dirty(&self) {
        self.state_and_version
            .fetch_and(!DIRTY_MASK, Ordering::SeqCst);
    }

    /// Non-locking dirty clear for single-writer flush paths (WAL flush,
    /// quiesced checkpoints) where no other thread can be touching the page.
    pub fn clear_dirty_unchecked(&self) {
        self.state_and_version
            .fetch_and(!DIRTY_MASK, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.load() & DIRTY_MASK != 0
    }

    /// LOCKED -> EVICTED after a successful eviction: version bumped, dirty
    /// dropped (the flush already happened).
    pub fn evict(&self) {
        let current = self.load();
        let next = Self::with_state_and_incremented_version(current, Self::EVICTED) & !DIRTY_MASK;
        self.state_and_version.store(next, Ordering::SeqCst);
    }

    /// Fresh EVICTED word for a page slot that has never been used (or is
    /// being reused after a truncation).
    pub fn reset_to_evicted(&self) {
        self.state_and_version.store(Self::EVICTED, Ordering::SeqCst);
    }
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            state_and_version: AtomicU64::new(Self::EVICTED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_evicted() {
        let state = PageState::default();
        assert_eq!(PageState::state_of(state.load()), PageState::EVICTED);
        assert!(!state.is_dirty());
    }

    #[test]
    fn lock_unlock_increments_version() {
        let state = PageState::default();
        let word = state.load();
        assert!(state.try_lock(word));
        assert_eq!(PageState::state_of(state.load()), PageState::LOCKED);
        state.unlock();
        let after = state.load();
        assert_eq!(PageState::state_of(after), PageState::UNLOCKED);
        assert_eq!(PageState::version_of(after), VERSION_INCREMENT);
    }

    #[test]
    fn stale_cas_fails() {
        let state = PageState::default();
        let stale = state.load();
        assert!(state.try_lock(stale));
        state.unlock();
        // The word changed (state + version), so the old observation loses.
        assert!(!state.try_lock(stale));
    }

    #[test]
    fn dirty_survives_unlock() {
        let state = PageState::default();
        assert!(state.try_lock(state.load()));
        state.set_dirty();
        state.unlock();
        assert!(state.is_dirty());
        assert!(state.try_lock(state.load()));
        state.clear_dirty();
        state.unlock();
        assert!(!state.is_dirty());
    }

    #[test]
    fn evict_clears_dirty_and_bumps_version() {
        let state = PageState::default();
        assert!(state.try_lock(state.load()));
        state.set_dirty();
        state.unlock();
        let unpinned = state.load();
        assert!(state.try_mark(unpinned));
        assert!(state.try_lock(state.load()));
        state.evict();
        let word = state.load();
        assert_eq!(PageState::state_of(word), PageState::EVICTED);
        assert!(!state.is_dirty());
        assert!(PageState::version_of(word) > PageState::version_of(unpinned));
    }

    #[test]
    fn mark_and_clear_mark_keep_version() {
        let state = PageState::default();
        assert!(state.try_lock(state.load()));
        state.unlock();
        let word = state.load();
        assert!(state.try_mark(word));
        let marked = state.load();
        assert_eq!(PageState::version_of(marked), PageState::version_of(word));
        assert!(state.try_clear_mark(marked));
        assert_eq!(PageState::state_of(state.load()), PageState::UNLOCKED);
    }
}
