//! Transaction bookkeeping: ids, types, and the single-writer rule.
//!
//! Concurrency model: any number of read-only transactions may run next to
//! at most one write transaction. Readers see the last checkpointed state;
//! the writer's changes live in WAL shadows until commit. The commit path
//! itself (prepare, COMMIT record, checkpoint) is orchestrated by
//! [`Database`](crate::Database); this module owns who-is-active tracking
//! and the reader quiescing the checkpoint needs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::common::constants::DEFAULT_CHECKPOINT_WAIT_TIMEOUT_MICROS;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ReadOnly,
    Write,
}

/// A transaction handle. Obtained from
/// [`Database::begin_write_transaction`](crate::Database) or its read-only
/// sibling, and consumed by commit/rollback.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    trx_type: TransactionType,
}

impl Transaction {
    pub(crate) fn new(id: u64, trx_type: TransactionType) -> Self {
        Self { id, trx_type }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.trx_type
    }

    pub fn is_write(&self) -> bool {
        self.trx_type == TransactionType::Write
    }

    pub fn is_read_only(&self) -> bool {
        self.trx_type == TransactionType::ReadOnly
    }
}

pub struct TransactionManager {
    active_write_transaction_id: Mutex<Option<u64>>,
    active_read_only_transaction_ids: Mutex<HashSet<u64>>,
    last_transaction_id: AtomicU64,
    checkpoint_wait_timeout: Duration,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            active_write_transaction_id: Mutex::new(None),
            active_read_only_transaction_ids: Mutex::new(HashSet::new()),
            last_transaction_id: AtomicU64::new(0),
            checkpoint_wait_timeout: Duration::from_micros(
                DEFAULT_CHECKPOINT_WAIT_TIMEOUT_MICROS,
            ),
        }
    }

    /// Begins the write transaction. Fails with `TransactionConflict` while
    /// another write transaction is live.
    pub fn begin_write_transaction(&self) -> Result<Transaction> {
        let mut active = self.active_write_transaction_id.lock();
        if let Some(active_id) = *active {
            return Err(DbError::TransactionConflict(format!(
                "write transaction {active_id} is already active"
            )));
        }
        let id = self.next_transaction_id();
        *active = Some(id);
        debug!(id, "write transaction started");
        Ok(Transaction::new(id, TransactionType::Write))
    }

    pub fn begin_read_only_transaction(&self) -> Transaction {
        let id = self.next_transaction_id();
        self.active_read_only_transaction_ids.lock().insert(id);
        Transaction::new(id, TransactionType::ReadOnly)
    }

    pub(crate) fn end_transaction(&self, trx: &Transaction) {
        match trx.transaction_type() {
            TransactionType::Write => {
                let mut active = self.active_write_transaction_id.lock();
                debug_assert_eq!(*active, Some(trx.id()));
                *active = None;
            }
            TransactionType::ReadOnly => {
                self.active_read_only_transaction_ids.lock().remove(&trx.id());
            }
        }
    }

    pub fn has_active_write_transaction(&self) -> bool {
        self.active_write_transaction_id.lock().is_some()
    }

    pub fn active_read_only_transaction_count(&self) -> usize {
        self.active_read_only_transaction_ids.lock().len()
    }

    /// Blocks until every read transaction has finished, so a checkpoint can
    /// swap the visible state without readers observing it half-applied.
    pub(crate) fn wait_until_no_active_read_transactions(&self) -> Result<()> {
        let deadline = Instant::now() + self.checkpoint_wait_timeout;
        while self.active_read_only_transaction_count() > 0 {
            if Instant::now() >= deadline {
                return Err(DbError::TransactionConflict(
                    "timed out waiting for read transactions to finish before checkpoint"
                        .to_string(),
                ));
            }
            std::thread::sleep(Duration::from_micros(500));
        }
        Ok(())
    }

    fn next_transaction_id(&self) -> u64 {
        self.last_transaction_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_write_transaction_at_a_time() {
        let manager = TransactionManager::new();
        let first = manager.begin_write_transaction().unwrap();
        assert!(matches!(
            manager.begin_write_transaction(),
            Err(DbError::TransactionConflict(_))
        ));
        manager.end_transaction(&first);
        assert!(manager.begin_write_transaction().is_ok());
    }

    #[test]
    fn read_transactions_are_tracked() {
        let manager = TransactionManager::new();
        let r1 = manager.begin_read_only_transaction();
        let r2 = manager.begin_read_only_transaction();
        assert_eq!(manager.active_read_only_transaction_count(), 2);
        assert_ne!(r1.id(), r2.id());
        manager.end_transaction(&r1);
        manager.end_transaction(&r2);
        assert_eq!(manager.active_read_only_transaction_count(), 0);
        manager.wait_until_no_active_read_transactions().unwrap();
    }
}
