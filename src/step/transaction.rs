use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::{BatchError, Result};

/// Handle to a transaction opened by a [`TransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct Transaction {
    id: u64,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Commit scope around a chunk.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Transaction>;
    fn commit(&self, transaction: Transaction) -> Result<()>;
    fn rollback(&self, transaction: Transaction) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionCounts {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    active: HashSet<u64>,
    counts: TransactionCounts,
}

/// Transaction manager with no resource behind it. It only checks that
/// every transaction is finished exactly once and counts outcomes.
#[derive(Debug, Default)]
pub struct ResourcelessTransactionManager {
    next_id: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl ResourcelessTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counts(&self) -> TransactionCounts {
        self.ledger().counts
    }

    pub fn active(&self) -> usize {
        self.ledger().active.len()
    }

    fn finish(&self, transaction: Transaction, commit: bool) -> Result<()> {
        let mut ledger = self.ledger();
        if !ledger.active.remove(&transaction.id) {
            return Err(BatchError::Transaction(format!(
                "transaction {} is not active",
                transaction.id
            )));
        }
        if commit {
            ledger.counts.committed += 1;
        } else {
            ledger.counts.rolled_back += 1;
        }
        Ok(())
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> Result<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut ledger = self.ledger();
        ledger.active.insert(id);
        ledger.counts.begun += 1;
        Ok(Transaction { id })
    }

    fn commit(&self, transaction: Transaction) -> Result<()> {
        self.finish(transaction, true)
    }

    fn rollback(&self, transaction: Transaction) -> Result<()> {
        self.finish(transaction, false)
    }
}
