//! Local storage collaborators.
//!
//! The coordinator never touches pages or index structures. It talks to the
//! local engine through [`LocalStorage`] (record id allocation, version
//! lookups, applying a committed change set, running schema commands) and to
//! the index layer through [`IndexManager`] (index kind and current value for
//! a key). [`MemoryStorage`] implements both in memory and backs the tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CommitError, Result},
    transaction::{ClientTransaction, IndexOperation, OperationKind, RecordId, RecordOperation},
    tx_id::TransactionId,
    tx_log::TxMetadata,
};

/// How a storage call was reached.
///
/// `Replicated` means the coordinator already distributed the operation and
/// the engine must not route it through the coordinator again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Local,
    Replicated,
}

/// Index kinds known to the index layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    Unique,
    UniqueHash,
    Dictionary,
    DictionaryHash,
    NotUnique,
    FullText,
}

impl IndexType {
    /// Whether a key may map to at most one record.
    pub fn is_unique(self) -> bool {
        matches!(self, IndexType::Unique | IndexType::UniqueHash)
    }

    /// Whether concurrent writers of the same key must be serialized.
    pub fn needs_key_lock(self) -> bool {
        matches!(
            self,
            IndexType::Unique
                | IndexType::UniqueHash
                | IndexType::Dictionary
                | IndexType::DictionaryHash
        )
    }
}

/// Version information for a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub rid: RecordId,
    pub version: u32,
}

/// Index lookups needed for duplicate-key detection.
pub trait IndexManager: Send + Sync {
    fn index_type(&self, name: &str) -> Option<IndexType>;

    /// Record currently stored under `key`, `None` for the null key.
    fn current_value(&self, name: &str, key: Option<&str>) -> Option<RecordId>;
}

/// The local engine as seen by the coordinator.
///
/// Implementations synchronize internally; the coordinator only guarantees
/// that writes arrive validated and under the locks of their transaction.
pub trait LocalStorage: Send + Sync {
    /// Check a created or updated record against local constraints.
    fn validate_record(&self, op: &RecordOperation) -> Result<()>;

    /// Fix the final ids of created records.
    ///
    /// Temporary ids are replaced by freshly allocated positions and the
    /// transaction is remapped. Records that already carry a real id (assigned
    /// by the origin) are reserved at exactly that position, failing with
    /// [`CommitError::ConcurrentCreate`] if the position is not free.
    /// Returns every reserved id.
    fn preallocate_record_ids(&self, tx: &mut ClientTransaction) -> Result<Vec<RecordId>>;

    /// Give back reservations of a transaction that will not commit.
    fn release_preallocated(&self, rids: &[RecordId]);

    /// Apply a validated transaction, consuming its reservations.
    fn commit_preallocated(&self, tx: &ClientTransaction, metadata: &TxMetadata) -> Result<()>;

    fn record_metadata(&self, rid: RecordId) -> Option<RecordMetadata>;

    fn is_deleted(&self, rid: RecordId) -> bool;

    /// Run a schema command.
    fn execute_command(&self, query: &str, mode: RunMode) -> Result<()>;

    /// Persist metadata for a commit that carries no record changes.
    fn apply_metadata(&self, metadata: &TxMetadata) -> Result<()>;

    fn indexes(&self) -> &dyn IndexManager;
}

/// A record held by [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u32,
    pub content: Vec<u8>,
    pub deleted: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    next_position: i64,
    reserved: BTreeSet<i64>,
    free: BTreeSet<i64>,
}

#[derive(Debug, Default)]
struct StorageState {
    records: BTreeMap<RecordId, StoredRecord>,
    clusters: HashMap<i32, ClusterState>,
    cluster_names: BTreeMap<String, i32>,
    index_types: HashMap<String, IndexType>,
    index_values: HashMap<(String, Option<String>), RecordId>,
    applied: Vec<TxMetadata>,
    commands: Vec<(String, RunMode)>,
    failing_commands: usize,
    max_record_size: Option<usize>,
}

impl StorageState {
    fn taken(&self, rid: RecordId) -> bool {
        self.records.contains_key(&rid)
            || self
                .clusters
                .get(&rid.cluster)
                .is_some_and(|c| c.reserved.contains(&rid.position))
    }

    fn allocate(&mut self, cluster: i32) -> RecordId {
        let state = self.clusters.entry(cluster).or_default();
        let position = match state.free.pop_first() {
            Some(position) => position,
            None => {
                let position = state.next_position;
                state.next_position += 1;
                position
            },
        };
        state.reserved.insert(position);
        RecordId::new(cluster, position)
    }

    fn reserve(&mut self, rid: RecordId) {
        let state = self.clusters.entry(rid.cluster).or_default();
        state.free.remove(&rid.position);
        state.reserved.insert(rid.position);
        state.next_position = state.next_position.max(rid.position + 1);
    }

    fn next_free(&self, cluster: i32) -> RecordId {
        let position = self
            .clusters
            .get(&cluster)
            .map(|c| c.free.first().copied().unwrap_or(c.next_position))
            .unwrap_or(0);
        RecordId::new(cluster, position)
    }

    fn release(&mut self, rid: RecordId) {
        let stored = self.records.contains_key(&rid);
        if let Some(state) = self.clusters.get_mut(&rid.cluster) {
            if state.reserved.remove(&rid.position) && !stored {
                state.free.insert(rid.position);
            }
        }
    }
}

/// In-memory [`LocalStorage`] and [`IndexManager`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<StorageState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject records whose content exceeds `bytes`.
    pub fn with_max_record_size(self, bytes: usize) -> Self {
        self.state.lock().max_record_size = Some(bytes);
        self
    }

    pub fn define_index(&self, name: &str, index_type: IndexType) {
        self.state
            .lock()
            .index_types
            .insert(name.to_string(), index_type);
    }

    /// Store a record directly, bypassing any transaction.
    pub fn insert_record(&self, rid: RecordId, version: u32, content: Vec<u8>) {
        let mut state = self.state.lock();
        state.reserve(rid);
        if let Some(cluster) = state.clusters.get_mut(&rid.cluster) {
            cluster.reserved.remove(&rid.position);
        }
        state.records.insert(
            rid,
            StoredRecord {
                version,
                content,
                deleted: false,
            },
        );
    }

    /// Store an index entry directly, bypassing any transaction.
    pub fn insert_index_value(&self, name: &str, key: Option<&str>, rid: RecordId) {
        self.state
            .lock()
            .index_values
            .insert((name.to_string(), key.map(str::to_string)), rid);
    }

    /// Make the next `count` schema commands fail.
    pub fn fail_next_commands(&self, count: usize) {
        self.state.lock().failing_commands = count;
    }

    pub fn record(&self, rid: RecordId) -> Option<StoredRecord> {
        self.state.lock().records.get(&rid).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| !r.deleted)
            .count()
    }

    /// Ids of every transaction applied so far, in apply order.
    pub fn applied_transactions(&self) -> Vec<TransactionId> {
        self.state.lock().applied.iter().map(|m| m.tx_id).collect()
    }

    /// Schema commands executed so far, in order.
    pub fn executed_commands(&self) -> Vec<(String, RunMode)> {
        self.state.lock().commands.clone()
    }

    pub fn cluster_id(&self, name: &str) -> Option<i32> {
        self.state.lock().cluster_names.get(name).copied()
    }

    pub fn reserved_count(&self) -> usize {
        self.state
            .lock()
            .clusters
            .values()
            .map(|c| c.reserved.len())
            .sum()
    }
}

impl IndexManager for MemoryStorage {
    fn index_type(&self, name: &str) -> Option<IndexType> {
        self.state.lock().index_types.get(name).copied()
    }

    fn current_value(&self, name: &str, key: Option<&str>) -> Option<RecordId> {
        self.state
            .lock()
            .index_values
            .get(&(name.to_string(), key.map(str::to_string)))
            .copied()
    }
}

impl LocalStorage for MemoryStorage {
    fn validate_record(&self, op: &RecordOperation) -> Result<()> {
        if op.kind == OperationKind::Deleted {
            return Ok(());
        }
        if op.cluster_name.is_empty() {
            return Err(CommitError::Validation(format!(
                "record {} has no cluster name",
                op.rid
            )));
        }
        match self.state.lock().max_record_size {
            Some(max) if op.content.len() > max => Err(CommitError::Validation(format!(
                "record {} is {} bytes, limit is {max}",
                op.rid,
                op.content.len()
            ))),
            _ => Ok(()),
        }
    }

    fn preallocate_record_ids(&self, tx: &mut ClientTransaction) -> Result<Vec<RecordId>> {
        let mut state = self.state.lock();
        let mut reserved = Vec::new();
        let mut remaps = Vec::new();

        for op in tx
            .operations
            .iter()
            .filter(|op| op.kind == OperationKind::Created)
        {
            if op.rid.is_temporary() {
                let rid = state.allocate(op.rid.cluster);
                remaps.push((op.rid, rid));
                reserved.push(rid);
            } else if state.taken(op.rid) {
                let actual = state.next_free(op.rid.cluster);
                for rid in &reserved {
                    state.release(*rid);
                }
                return Err(CommitError::ConcurrentCreate {
                    expected: op.rid,
                    actual,
                });
            } else {
                state.reserve(op.rid);
                reserved.push(op.rid);
            }
        }
        drop(state);

        for (old, new) in remaps {
            tx.remap(old, new);
        }
        Ok(reserved)
    }

    fn release_preallocated(&self, rids: &[RecordId]) {
        let mut state = self.state.lock();
        for rid in rids {
            state.release(*rid);
        }
    }

    fn commit_preallocated(&self, tx: &ClientTransaction, metadata: &TxMetadata) -> Result<()> {
        let mut state = self.state.lock();

        for op in &tx.operations {
            match op.kind {
                OperationKind::Created => {
                    if let Some(cluster) = state.clusters.get_mut(&op.rid.cluster) {
                        cluster.reserved.remove(&op.rid.position);
                    }
                    state.records.insert(
                        op.rid,
                        StoredRecord {
                            version: 1,
                            content: op.content.clone(),
                            deleted: false,
                        },
                    );
                },
                OperationKind::Updated => {
                    let record = state.records.get_mut(&op.rid).ok_or_else(|| {
                        CommitError::Storage(format!("record {} not found", op.rid))
                    })?;
                    record.version += 1;
                    record.content.clone_from(&op.content);
                },
                OperationKind::Deleted => {
                    if let Some(record) = state.records.get_mut(&op.rid) {
                        record.version += 1;
                        record.deleted = true;
                        record.content.clear();
                    }
                },
            }
        }

        for (name, changes) in &tx.index_changes {
            for (key, entries) in changes.keys() {
                let slot = (name.clone(), key.map(str::to_string));
                for entry in entries {
                    match (entry.operation, entry.value) {
                        (IndexOperation::Put, Some(rid)) => {
                            state.index_values.insert(slot.clone(), rid);
                        },
                        (IndexOperation::Remove, Some(rid)) => {
                            if state.index_values.get(&slot) == Some(&rid) {
                                state.index_values.remove(&slot);
                            }
                        },
                        (_, None) => {
                            state.index_values.remove(&slot);
                        },
                    }
                }
            }
        }

        state.applied.push(*metadata);
        Ok(())
    }

    fn record_metadata(&self, rid: RecordId) -> Option<RecordMetadata> {
        self.state.lock().records.get(&rid).map(|r| RecordMetadata {
            rid,
            version: r.version,
        })
    }

    fn is_deleted(&self, rid: RecordId) -> bool {
        self.state.lock().records.get(&rid).is_some_and(|r| r.deleted)
    }

    fn execute_command(&self, query: &str, mode: RunMode) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_commands > 0 {
            state.failing_commands -= 1;
            return Err(CommitError::Storage(format!("command '{query}' failed")));
        }

        let words: Vec<&str> = query.split_whitespace().collect();
        match words.as_slice() {
            [create, cluster, name] if create.eq_ignore_ascii_case("create")
                && cluster.eq_ignore_ascii_case("cluster") =>
            {
                let name = name.trim_matches('`');
                let next = state.cluster_names.values().max().map_or(0, |id| id + 1);
                state.cluster_names.entry(name.to_string()).or_insert(next);
            },
            [drop, cluster, name] if drop.eq_ignore_ascii_case("drop")
                && cluster.eq_ignore_ascii_case("cluster") =>
            {
                let name = name.trim_matches('`');
                if state.cluster_names.remove(name).is_none() {
                    return Err(CommitError::Validation(format!(
                        "cluster '{name}' does not exist"
                    )));
                }
            },
            _ => {},
        }

        state.commands.push((query.to_string(), mode));
        Ok(())
    }

    fn apply_metadata(&self, metadata: &TxMetadata) -> Result<()> {
        self.state.lock().applied.push(*metadata);
        Ok(())
    }

    fn indexes(&self) -> &dyn IndexManager {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(sequence: u64) -> TxMetadata {
        TxMetadata {
            tx_id: TransactionId::new(1, sequence),
            offset: sequence,
        }
    }

    #[test]
    fn test_preallocate_remaps_temporary_ids() {
        let storage = MemoryStorage::new();
        let mut tx = ClientTransaction::new();
        let tmp = tx.create("person", 9, b"a".to_vec());
        tx.index_put("Person.email", Some("a@x"), tmp);

        let reserved = storage.preallocate_record_ids(&mut tx).unwrap();
        assert_eq!(reserved, vec![RecordId::new(9, 0)]);
        assert_eq!(tx.operations[0].rid, RecordId::new(9, 0));
        assert!(!tx.has_temporary_ids());
        assert_eq!(storage.reserved_count(), 1);
    }

    #[test]
    fn test_replica_reserves_origin_ids() {
        let origin = MemoryStorage::new();
        let replica = MemoryStorage::new();

        let mut tx = ClientTransaction::new();
        tx.create("person", 9, vec![]);
        origin.preallocate_record_ids(&mut tx).unwrap();

        let mut copy = tx.clone();
        let reserved = replica.preallocate_record_ids(&mut copy).unwrap();
        assert_eq!(reserved, vec![RecordId::new(9, 0)]);
        assert_eq!(copy, tx);
    }

    #[test]
    fn test_taken_position_is_concurrent_create() {
        let storage = MemoryStorage::new();
        storage.insert_record(RecordId::new(9, 0), 1, vec![]);

        let mut tx = ClientTransaction::new();
        tx.operations.push(RecordOperation {
            rid: RecordId::new(9, 0),
            cluster_name: "person".into(),
            kind: OperationKind::Created,
            version: 0,
            content: vec![],
        });

        let err = storage.preallocate_record_ids(&mut tx).unwrap_err();
        assert_eq!(
            err,
            CommitError::ConcurrentCreate {
                expected: RecordId::new(9, 0),
                actual: RecordId::new(9, 1),
            }
        );
        assert!(!err.should_requeue());
    }

    #[test]
    fn test_released_positions_are_reused() {
        let storage = MemoryStorage::new();
        let mut tx = ClientTransaction::new();
        tx.create("person", 9, vec![]);
        let reserved = storage.preallocate_record_ids(&mut tx).unwrap();
        storage.release_preallocated(&reserved);
        assert_eq!(storage.reserved_count(), 0);

        let mut again = ClientTransaction::new();
        again.create("person", 9, vec![]);
        assert_eq!(storage.preallocate_record_ids(&mut again).unwrap(), reserved);
    }

    #[test]
    fn test_commit_applies_operations_and_indexes() {
        let storage = MemoryStorage::new();
        storage.define_index("Person.email", IndexType::Unique);
        storage.insert_record(RecordId::new(9, 5), 3, b"old".to_vec());

        let mut tx = ClientTransaction::new();
        let tmp = tx.create("person", 9, b"new".to_vec());
        tx.update("person", RecordId::new(9, 5), 3, b"changed".to_vec());
        tx.index_put("Person.email", Some("a@x"), tmp);
        storage.preallocate_record_ids(&mut tx).unwrap();
        let created = tx.operations[0].rid;

        storage.commit_preallocated(&tx, &metadata(1)).unwrap();

        assert_eq!(storage.record(created).unwrap().version, 1);
        let updated = storage.record(RecordId::new(9, 5)).unwrap();
        assert_eq!(updated.version, 4);
        assert_eq!(updated.content, b"changed");
        assert_eq!(storage.current_value("Person.email", Some("a@x")), Some(created));
        assert_eq!(storage.reserved_count(), 0);
        assert_eq!(storage.applied_transactions(), vec![TransactionId::new(1, 1)]);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let storage = MemoryStorage::new();
        let rid = RecordId::new(9, 1);
        storage.insert_record(rid, 2, b"x".to_vec());

        let mut tx = ClientTransaction::new();
        tx.delete("person", rid, 2);
        storage.commit_preallocated(&tx, &metadata(1)).unwrap();

        assert!(storage.is_deleted(rid));
        assert_eq!(storage.record_count(), 0);
        assert_eq!(storage.record_metadata(rid).unwrap().version, 3);
    }

    #[test]
    fn test_validate_record_size_limit() {
        let storage = MemoryStorage::new().with_max_record_size(4);
        let mut tx = ClientTransaction::new();
        tx.create("person", 9, b"too large".to_vec());

        let err = storage.validate_record(&tx.operations[0]).unwrap_err();
        assert!(matches!(err, CommitError::Validation(_)));
    }

    #[test]
    fn test_cluster_commands() {
        let storage = MemoryStorage::new();
        storage
            .execute_command("CREATE CLUSTER audit", RunMode::Replicated)
            .unwrap();
        assert_eq!(storage.cluster_id("audit"), Some(0));

        storage
            .execute_command("DROP CLUSTER audit", RunMode::Local)
            .unwrap();
        assert_eq!(storage.cluster_id("audit"), None);
        assert!(storage
            .execute_command("DROP CLUSTER audit", RunMode::Local)
            .is_err());
        assert_eq!(storage.executed_commands().len(), 2);
    }

    #[test]
    fn test_failing_commands() {
        let storage = MemoryStorage::new();
        storage.fail_next_commands(1);
        assert!(storage.execute_command("CREATE CLUSTER a", RunMode::Local).is_err());
        assert!(storage.execute_command("CREATE CLUSTER a", RunMode::Local).is_ok());
    }
}
