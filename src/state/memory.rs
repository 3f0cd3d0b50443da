//! In-memory transactional state store.
//!
//! Key/value map with a write-set transaction: writes go to a pending
//! overlay that reads observe, commit merges the overlay into the committed
//! map, rollback discards it. Enforces the one-open-transaction invariant.

use crate::error::EngineError;
use crate::state::{StateStoreError, Transaction, TransactionContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct StoreInner {
    committed: HashMap<String, Vec<u8>>,
    /// `Some` while a transaction is open; values of `None` are deletes.
    pending: Option<HashMap<String, Option<Vec<u8>>>>,
    recoverable_commit_failures: u32,
}

/// In-memory `TransactionContext` implementation.
#[derive(Clone)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                committed: HashMap::new(),
                pending: None,
                recoverable_commit_failures: 0,
            })),
        }
    }

    /// Read a value, observing the open transaction's overlay if any.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        if let Some(pending) = &inner.pending {
            if let Some(value) = pending.get(key) {
                return value.clone();
            }
        }
        inner.committed.get(key).cloned()
    }

    /// Buffer a write in the open transaction.
    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StateStoreError> {
        let mut inner = self.lock();
        match inner.pending.as_mut() {
            Some(pending) => {
                pending.insert(key.to_string(), Some(value));
                Ok(())
            }
            None => Err(StateStoreError::NoOpenTransaction),
        }
    }

    /// Buffer a delete in the open transaction.
    pub fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        let mut inner = self.lock();
        match inner.pending.as_mut() {
            Some(pending) => {
                pending.insert(key.to_string(), None);
                Ok(())
            }
            None => Err(StateStoreError::NoOpenTransaction),
        }
    }

    /// Number of committed entries, ignoring any open transaction.
    pub fn committed_len(&self) -> usize {
        self.lock().committed.len()
    }

    /// Inject recoverable failures into the next `n` commit attempts.
    pub fn fail_next_commits(&self, n: u32) {
        self.lock().recoverable_commit_failures = n;
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext for InMemoryStateStore {
    fn begin(&self) -> Result<Box<dyn Transaction>, StateStoreError> {
        let mut inner = self.lock();
        if inner.pending.is_some() {
            return Err(StateStoreError::TransactionInProgress);
        }
        inner.pending = Some(HashMap::new());
        Ok(Box::new(InMemoryTransaction {
            inner: self.inner.clone(),
        }))
    }
}

struct InMemoryTransaction {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryTransaction {
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Transaction for InMemoryTransaction {
    fn run(
        &mut self,
        work: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        work()
    }

    fn commit(&mut self) -> Result<(), StateStoreError> {
        let mut inner = self.lock();
        if inner.recoverable_commit_failures > 0 {
            inner.recoverable_commit_failures -= 1;
            return Err(StateStoreError::Recoverable {
                reason: "injected commit contention".to_string(),
            });
        }
        let pending = inner
            .pending
            .take()
            .ok_or(StateStoreError::NoOpenTransaction)?;
        for (key, value) in pending {
            match value {
                Some(value) => {
                    inner.committed.insert(key, value);
                }
                None => {
                    inner.committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StateStoreError> {
        let mut inner = self.lock();
        if inner.pending.take().is_none() {
            return Err(StateStoreError::NoOpenTransaction);
        }
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        // A dropped transaction must not leave the store locked for the next
        // record; treat it as an implicit rollback.
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_merges_writes() {
        let store = InMemoryStateStore::new();
        let mut txn = store.begin().unwrap();
        store.put("a", vec![1]).unwrap();
        store.put("b", vec![2]).unwrap();
        assert_eq!(store.get("a"), Some(vec![1]));
        assert_eq!(store.committed_len(), 0);

        txn.commit().unwrap();
        assert_eq!(store.committed_len(), 2);
        assert_eq!(store.get("b"), Some(vec![2]));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = InMemoryStateStore::new();
        let mut txn = store.begin().unwrap();
        store.put("a", vec![1]).unwrap();
        txn.rollback().unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.committed_len(), 0);
    }

    #[test]
    fn test_single_open_transaction() {
        let store = InMemoryStateStore::new();
        let _txn = store.begin().unwrap();
        assert!(matches!(
            store.begin(),
            Err(StateStoreError::TransactionInProgress)
        ));
    }

    #[test]
    fn test_drop_releases_transaction() {
        let store = InMemoryStateStore::new();
        {
            let _txn = store.begin().unwrap();
            store.put("a", vec![1]).unwrap();
        }
        // Implicit rollback on drop.
        assert_eq!(store.get("a"), None);
        assert!(store.begin().is_ok());
    }

    #[test]
    fn test_write_without_transaction_fails() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.put("a", vec![1]),
            Err(StateStoreError::NoOpenTransaction)
        ));
    }

    #[test]
    fn test_injected_commit_failures_are_recoverable() {
        let store = InMemoryStateStore::new();
        store.fail_next_commits(1);
        let mut txn = store.begin().unwrap();
        store.put("a", vec![1]).unwrap();

        assert!(matches!(
            txn.commit(),
            Err(StateStoreError::Recoverable { .. })
        ));
        // The transaction stays open, so a retried commit succeeds.
        txn.commit().unwrap();
        assert_eq!(store.get("a"), Some(vec![1]));
    }

    #[test]
    fn test_delete_is_transactional() {
        let store = InMemoryStateStore::new();
        let mut txn = store.begin().unwrap();
        store.put("a", vec![1]).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a"), None);
        txn.rollback().unwrap();
        assert_eq!(store.get("a"), Some(vec![1]));
    }
}
