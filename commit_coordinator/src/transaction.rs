//! Locally assembled write transactions.
//!
//! A [`ClientTransaction`] is the change set a client hands to the coordinator:
//! record operations plus the index changes they imply. Newly created records
//! carry temporary ids (negative positions) until the storage engine
//! pre-allocates real ones, at which point [`ClientTransaction::remap`] rewrites
//! every reference so that all replicas agree on the final ids.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical record identifier: `(cluster, position)`.
///
/// The derived ordering (cluster first, then position) is the lock order
/// for record locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub cluster: i32,
    pub position: i64,
}

impl RecordId {
    pub const fn new(cluster: i32, position: i64) -> Self {
        Self { cluster, position }
    }

    /// Placeholder id for the `n`-th record created in a transaction.
    pub const fn temporary(cluster: i32, n: i64) -> Self {
        Self {
            cluster,
            position: -(n + 1),
        }
    }

    /// Whether the position has not been allocated yet.
    pub const fn is_temporary(&self) -> bool {
        self.position < 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// Kind of change applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Created,
    Updated,
    Deleted,
}

/// One record change inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOperation {
    pub rid: RecordId,
    /// Name of the data cluster the record lives in (drives quorum).
    pub cluster_name: String,
    pub kind: OperationKind,
    /// Version of the record as seen by the writer.
    pub version: u32,
    pub content: Vec<u8>,
}

/// Operation recorded against an index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOperation {
    Put,
    Remove,
}

/// A single index change for one key, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub operation: IndexOperation,
    pub value: Option<RecordId>,
}

/// All changes to one index, grouped by key. The null key is tracked apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChanges {
    pub per_key: BTreeMap<String, Vec<IndexEntry>>,
    pub null_key: Vec<IndexEntry>,
}

impl IndexChanges {
    fn entries_mut(&mut self, key: Option<&str>) -> &mut Vec<IndexEntry> {
        match key {
            Some(key) => self.per_key.entry(key.to_string()).or_default(),
            None => &mut self.null_key,
        }
    }

    /// Iterate `(key, entries)` pairs, the null key last.
    pub fn keys(&self) -> impl Iterator<Item = (Option<&str>, &[IndexEntry])> {
        self.per_key
            .iter()
            .map(|(k, v)| (Some(k.as_str()), v.as_slice()))
            .chain((!self.null_key.is_empty()).then_some((None, self.null_key.as_slice())))
    }
}

/// A write transaction assembled on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTransaction {
    pub operations: Vec<RecordOperation>,
    pub index_changes: BTreeMap<String, IndexChanges>,
    created: i64,
}

impl ClientTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new record and return its temporary id.
    pub fn create(&mut self, cluster_name: &str, cluster: i32, content: Vec<u8>) -> RecordId {
        let rid = RecordId::temporary(cluster, self.created);
        self.created += 1;
        self.operations.push(RecordOperation {
            rid,
            cluster_name: cluster_name.to_string(),
            kind: OperationKind::Created,
            version: 0,
            content,
        });
        rid
    }

    pub fn update(&mut self, cluster_name: &str, rid: RecordId, version: u32, content: Vec<u8>) {
        self.operations.push(RecordOperation {
            rid,
            cluster_name: cluster_name.to_string(),
            kind: OperationKind::Updated,
            version,
            content,
        });
    }

    pub fn delete(&mut self, cluster_name: &str, rid: RecordId, version: u32) {
        self.operations.push(RecordOperation {
            rid,
            cluster_name: cluster_name.to_string(),
            kind: OperationKind::Deleted,
            version,
            content: Vec::new(),
        });
    }

    pub fn index_put(&mut self, index: &str, key: Option<&str>, rid: RecordId) {
        self.index_changes
            .entry(index.to_string())
            .or_default()
            .entries_mut(key)
            .push(IndexEntry {
                operation: IndexOperation::Put,
                value: Some(rid),
            });
    }

    pub fn index_remove(&mut self, index: &str, key: Option<&str>, rid: Option<RecordId>) {
        self.index_changes
            .entry(index.to_string())
            .or_default()
            .entries_mut(key)
            .push(IndexEntry {
                operation: IndexOperation::Remove,
                value: rid,
            });
    }

    /// Names of every data cluster the transaction writes to.
    pub fn involved_clusters(&self) -> BTreeSet<&str> {
        self.operations
            .iter()
            .map(|op| op.cluster_name.as_str())
            .collect()
    }

    /// Whether any created record still has a temporary id.
    pub fn has_temporary_ids(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.kind == OperationKind::Created && op.rid.is_temporary())
    }

    /// Replace every reference to `old` with `new`.
    pub fn remap(&mut self, old: RecordId, new: RecordId) {
        for op in &mut self.operations {
            if op.rid == old {
                op.rid = new;
            }
        }
        for changes in self.index_changes.values_mut() {
            let entries = changes
                .per_key
                .values_mut()
                .flat_map(|v| v.iter_mut())
                .chain(changes.null_key.iter_mut());
            for entry in entries {
                if entry.value == Some(old) {
                    entry.value = Some(new);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.index_changes.is_empty()
    }
}
