//! Transactions: id allocation, the striped registry guarding each
//! transaction's undo state, and the public `Transaction` handle.

pub mod master_log;
pub mod undo_log;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    store::StoreCore,
    types::{ResultOf, SmallResult},
};

use self::undo_log::UndoLog;

/// Sentinel id for untracked operations (recovery, rollback
/// application, convenience writes). Never registered.
pub const BOGUS_TXN_ID: u64 = 0;

/// Undo state of one live transaction. Guarded by its own mutex; the
/// registry stripe only protects the map itself.
pub(crate) struct TxnState {
    pub undo: UndoLog,
    /// Fragment descriptors of deleted values, kept alive until the
    /// transaction commits (rollback re-links them).
    pub trash: HashMap<Vec<u8>, Vec<u8>>,
}

impl TxnState {
    fn new(txn_id: u64) -> Self {
        Self {
            undo: UndoLog::new(txn_id),
            trash: HashMap::new(),
        }
    }
}

/// Striped map from transaction id to its state. The stripe count is a
/// power of two; a transaction always hashes to the same stripe, which
/// serializes registry operations without one global lock.
pub(crate) struct TransactionRegistry {
    stripes: Vec<Mutex<HashMap<u64, Arc<Mutex<TxnState>>>>>,
}

impl TransactionRegistry {
    pub fn new(stripe_count: usize) -> Self {
        assert!(stripe_count.is_power_of_two());
        let mut stripes = Vec::with_capacity(stripe_count);
        for _ in 0..stripe_count {
            stripes.push(Mutex::new(HashMap::new()));
        }
        Self { stripes }
    }

    fn stripe(&self, txn_id: u64) -> &Mutex<HashMap<u64, Arc<Mutex<TxnState>>>> {
        &self.stripes[txn_id as usize & (self.stripes.len() - 1)]
    }

    pub fn register(&self, txn_id: u64) -> Arc<Mutex<TxnState>> {
        let state = Arc::new(Mutex::new(TxnState::new(txn_id)));
        self.stripe(txn_id)
            .lock()
            .unwrap()
            .insert(txn_id, state.clone());
        state
    }

    pub fn get(&self, txn_id: u64) -> Option<Arc<Mutex<TxnState>>> {
        self.stripe(txn_id).lock().unwrap().get(&txn_id).cloned()
    }

    pub fn remove(&self, txn_id: u64) -> Option<Arc<Mutex<TxnState>>> {
        self.stripe(txn_id).lock().unwrap().remove(&txn_id)
    }

    /// Snapshot of every live transaction's state, for the commit
    /// coordinator's master-log capture.
    pub fn all(&self) -> Vec<Arc<Mutex<TxnState>>> {
        let mut out = Vec::new();
        for stripe in &self.stripes {
            out.extend(stripe.lock().unwrap().values().cloned());
        }
        out
    }
}

/// Handle to a live transaction. Writes made through it are reversible
/// until `commit`; `rollback` applies the undo log.
pub struct Transaction {
    id: u64,
    core: Arc<StoreCore>,
}

impl Transaction {
    pub(crate) fn new(id: u64, core: Arc<StoreCore>) -> Self {
        Self { id, core }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Make the transaction's changes permanent: the undo log is
    /// truncated with commit markers and trashed fragment chains are
    /// released.
    pub fn commit(&self) -> SmallResult {
        self.core.commit_transaction(self.id)
    }

    /// Reverse every change made by this transaction.
    pub fn rollback(&self) -> SmallResult {
        self.core.rollback_transaction(self.id)
    }

    /// Open a nested scope; the returned savepoint feeds
    /// `scope_rollback`.
    pub fn scope_enter(&self) -> ResultOf<u64> {
        self.core.txn_scope_enter(self.id)
    }

    pub fn scope_commit(&self) -> ResultOf<u64> {
        self.core.txn_scope_commit(self.id)
    }

    pub fn scope_rollback(&self, savepoint: u64) -> SmallResult {
        self.core.txn_scope_rollback(self.id, savepoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_get_remove() {
        let registry = TransactionRegistry::new(8);

        let s1 = registry.register(10);
        assert!(Arc::ptr_eq(&registry.get(10).unwrap(), &s1));

        registry.register(11);
        assert_eq!(registry.all().len(), 2);

        registry.remove(10);
        assert!(registry.get(10).is_none());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_registry_stripes_cover_ids() {
        let registry = TransactionRegistry::new(4);
        for id in 1..100u64 {
            registry.register(id);
        }
        assert_eq!(registry.all().len(), 99);
        for id in 1..100u64 {
            assert!(registry.get(id).is_some());
        }
    }
}
