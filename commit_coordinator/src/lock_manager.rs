// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exclusive record and index-key locks for in-flight transactions.
//!
//! # Overview
//!
//! Every replica serializes conflicting transactions through the same lock
//! table. Two kinds of key are locked:
//!
//! - **Record ids** for every record the transaction touches.
//! - **Index keys** (`index#key`, or `index#null`) for unique and dictionary
//!   indexes. Non-unique indexes need no cross-transaction lock.
//!
//! # Deadlock avoidance
//!
//! There is no wait-for graph. A transaction always requests its locks in the
//! natural order of [`LockKey`]: record ids first, sorted by `(cluster,
//! position)`, then index keys sorted lexicographically. Since every node uses
//! the same order, two transactions can never wait on each other in a cycle.
//! The only other escape hatch is the lock wait timeout, which surfaces as
//! [`CommitError::LockTimeout`].
//!
//! ```text
//!   tx A wants {#9:4, #9:1, idx#k}     tx B wants {idx#k, #9:1}
//!   A: #9:1 -> #9:4 -> idx#k            B: #9:1 (waits for A) -> idx#k
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CommitError, Result},
    storage::IndexManager,
    transaction::{ClientTransaction, RecordId},
    tx_id::RequestId,
};

/// Key in the lock table.
///
/// The derived ordering puts every record before every index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockKey {
    Record(RecordId),
    IndexKey(String),
}

impl LockKey {
    /// Lock key for `key` in `index`. The null key is spelled `null`.
    pub fn index(index: &str, key: Option<&str>) -> Self {
        LockKey::IndexKey(format!("{}#{}", index, key.unwrap_or("null")))
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Record(rid) => write!(f, "{rid}"),
            LockKey::IndexKey(key) => f.write_str(key),
        }
    }
}

/// Deduplicate and sort keys into acquisition order.
pub fn order_lock_keys(keys: impl IntoIterator<Item = LockKey>) -> Vec<LockKey> {
    keys.into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Every lock `tx` needs, in acquisition order.
pub fn lock_keys_for(tx: &ClientTransaction, indexes: &dyn IndexManager) -> Result<Vec<LockKey>> {
    let mut keys: BTreeSet<LockKey> = tx
        .operations
        .iter()
        .map(|op| LockKey::Record(op.rid))
        .collect();

    for (name, changes) in &tx.index_changes {
        let index_type = indexes
            .index_type(name)
            .ok_or_else(|| CommitError::Validation(format!("index '{name}' not found")))?;
        if !index_type.needs_key_lock() {
            continue;
        }
        keys.extend(changes.keys().map(|(key, _)| LockKey::index(name, key)));
    }

    Ok(keys.into_iter().collect())
}

/// Table of exclusive locks keyed by record id or index key.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<HashMap<LockKey, RequestId>>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until `key` is free, then take it for `holder`.
    ///
    /// Taking a key the holder already owns is a no-op.
    pub fn lock(&self, key: &LockKey, holder: RequestId) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut table = self.table.lock();

        loop {
            let current = match table.get(key) {
                None => {
                    table.insert(key.clone(), holder);
                    return Ok(());
                },
                Some(current) if *current == holder => return Ok(()),
                Some(current) => *current,
            };

            if self.released.wait_until(&mut table, deadline).timed_out()
                && table.get(key).is_some_and(|h| *h != holder)
            {
                tracing::debug!(
                    key = %key,
                    holder = %current,
                    waiter = %holder,
                    "Lock wait timed out"
                );
                return Err(CommitError::LockTimeout {
                    key: key.to_string(),
                    holder: table.get(key).copied().unwrap_or(current),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Take `key` only if it is free right now.
    pub fn try_lock(&self, key: &LockKey, holder: RequestId) -> std::result::Result<(), RequestId> {
        let mut table = self.table.lock();
        match table.get(key) {
            Some(current) if *current != holder => Err(*current),
            _ => {
                table.insert(key.clone(), holder);
                Ok(())
            },
        }
    }

    /// Release `key` if `holder` owns it.
    pub fn unlock(&self, key: &LockKey, holder: RequestId) {
        let mut table = self.table.lock();
        if table.get(key) == Some(&holder) {
            table.remove(key);
            self.released.notify_all();
        }
    }

    /// Release every key in `keys` owned by `holder`.
    pub fn unlock_all<'a>(&self, keys: impl IntoIterator<Item = &'a LockKey>, holder: RequestId) {
        let mut table = self.table.lock();
        let mut released = 0usize;
        for key in keys {
            if table.get(key) == Some(&holder) {
                table.remove(key);
                released += 1;
            }
        }
        if released > 0 {
            self.released.notify_all();
        }
    }

    pub fn holder(&self, key: &LockKey) -> Option<RequestId> {
        self.table.lock().get(key).copied()
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.table.lock().contains_key(key)
    }

    pub fn active_lock_count(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::storage::{IndexType, MemoryStorage};

    fn req(message: u64) -> RequestId {
        RequestId::new(1, message)
    }

    fn record(position: i64) -> LockKey {
        LockKey::Record(RecordId::new(9, position))
    }

    #[test]
    fn test_records_sort_before_index_keys() {
        let keys = order_lock_keys(vec![
            LockKey::index("Person.email", Some("b")),
            record(7),
            LockKey::index("Person.email", Some("a")),
            LockKey::Record(RecordId::new(3, 100)),
            record(2),
        ]);
        assert_eq!(
            keys,
            vec![
                LockKey::Record(RecordId::new(3, 100)),
                record(2),
                record(7),
                LockKey::index("Person.email", Some("a")),
                LockKey::index("Person.email", Some("b")),
            ]
        );
    }

    #[test]
    fn test_order_is_independent_of_request_order() {
        let a = LockKey::index("idx", Some("a"));
        let b = LockKey::index("idx", Some("b"));
        assert_eq!(
            order_lock_keys(vec![b.clone(), a.clone()]),
            order_lock_keys(vec![a, b])
        );
    }

    #[test]
    fn test_order_deduplicates() {
        let keys = order_lock_keys(vec![record(1), record(1), record(0)]);
        assert_eq!(keys, vec![record(0), record(1)]);
    }

    #[test]
    fn test_null_key_spelling() {
        assert_eq!(
            LockKey::index("Person.nick", None).to_string(),
            "Person.nick#null"
        );
    }

    #[test]
    fn test_lock_keys_skip_non_unique_indexes() {
        let storage = MemoryStorage::new();
        storage.define_index("Person.email", IndexType::Unique);
        storage.define_index("Person.tags", IndexType::NotUnique);
        storage.define_index("Person.nick", IndexType::DictionaryHash);

        let mut tx = ClientTransaction::new();
        let b = RecordId::new(9, 8);
        let a = RecordId::new(9, 3);
        tx.update("person", b, 1, vec![]);
        tx.update("person", a, 1, vec![]);
        tx.index_put("Person.email", Some("z@x"), b);
        tx.index_put("Person.tags", Some("red"), b);
        tx.index_put("Person.nick", None, a);

        let keys = lock_keys_for(&tx, &storage).unwrap();
        assert_eq!(
            keys,
            vec![
                LockKey::Record(a),
                LockKey::Record(b),
                LockKey::index("Person.email", Some("z@x")),
                LockKey::index("Person.nick", None),
            ]
        );
    }

    #[test]
    fn test_lock_keys_unknown_index() {
        let storage = MemoryStorage::new();
        let mut tx = ClientTransaction::new();
        tx.index_put("Missing.idx", Some("k"), RecordId::new(1, 1));
        assert!(matches!(
            lock_keys_for(&tx, &storage),
            Err(CommitError::Validation(_))
        ));
    }

    #[test]
    fn test_lock_unlock() {
        let locks = LockManager::new(Duration::from_millis(50));
        let key = record(1);

        locks.lock(&key, req(1)).unwrap();
        assert!(locks.is_locked(&key));
        assert_eq!(locks.holder(&key), Some(req(1)));

        locks.unlock(&key, req(1));
        assert!(!locks.is_locked(&key));
        assert_eq!(locks.active_lock_count(), 0);
    }

    #[test]
    fn test_relock_by_holder_is_noop() {
        let locks = LockManager::new(Duration::from_millis(50));
        let key = record(1);
        locks.lock(&key, req(1)).unwrap();
        locks.lock(&key, req(1)).unwrap();
        assert_eq!(locks.active_lock_count(), 1);
    }

    #[test]
    fn test_unlock_by_non_holder_is_ignored() {
        let locks = LockManager::new(Duration::from_millis(50));
        let key = record(1);
        locks.lock(&key, req(1)).unwrap();
        locks.unlock(&key, req(2));
        assert_eq!(locks.holder(&key), Some(req(1)));
    }

    #[test]
    fn test_lock_times_out() {
        let locks = LockManager::new(Duration::from_millis(30));
        let key = record(1);
        locks.lock(&key, req(1)).unwrap();

        let err = locks.lock(&key, req(2)).unwrap_err();
        match err {
            CommitError::LockTimeout {
                key: name,
                holder,
                waited_ms,
            } => {
                assert_eq!(name, "#9:1");
                assert_eq!(holder, req(1));
                assert!(waited_ms >= 25);
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        let key = record(1);
        locks.lock(&key, req(1)).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            thread::spawn(move || locks.lock(&key, req(2)))
        };

        thread::sleep(Duration::from_millis(20));
        locks.unlock(&key, req(1));

        waiter.join().unwrap().unwrap();
        assert_eq!(locks.holder(&key), Some(req(2)));
    }

    #[test]
    fn test_try_lock_reports_holder() {
        let locks = LockManager::default();
        let key = record(1);
        locks.try_lock(&key, req(1)).unwrap();
        assert_eq!(locks.try_lock(&key, req(2)), Err(req(1)));
    }

    #[test]
    fn test_ordered_acquisition_never_deadlocks() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        let a = LockKey::index("idx", Some("a"));
        let b = LockKey::index("idx", Some("b"));

        let handles: Vec<_> = [vec![b.clone(), a.clone()], vec![a, b]]
            .into_iter()
            .enumerate()
            .map(|(worker, keys)| {
                let locks = Arc::clone(&locks);
                thread::spawn(move || {
                    for round in 0..200u64 {
                        let holder = RequestId::new(worker as u32, round);
                        let ordered = order_lock_keys(keys.clone());
                        for key in &ordered {
                            locks.lock(key, holder).unwrap();
                        }
                        locks.unlock_all(&ordered, holder);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.active_lock_count(), 0);
    }
}
