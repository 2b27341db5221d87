// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Transaction id sequencing and validation.
//!
//! # Overview
//!
//! [`TransactionLog`] is the process-wide record of which transaction ids have
//! been committed and which are promised to an in-flight context. It plays two
//! roles:
//!
//! - **Sequencer**: [`TransactionLog::next_id`] issues the next id for the
//!   local origin. Ids handed out for attempts that never commit are given back
//!   with [`TransactionLog::release_id`] and reissued first, so an aborted
//!   attempt does not leave a hole that would block every later id.
//! - **Validator**: [`TransactionLog::validate`] classifies any id against the
//!   last committed sequence of its origin and the promised set, and
//!   [`TransactionLog::commit`] advances the origin by exactly one.
//!
//! # Per-origin state
//!
//! ```text
//! origin 1:  committed 1..=7 | promised {8} | recycled {}
//! origin 2:  committed 1..=3 | promised {}  | recycled {}
//! ```
//!
//! | Candidate sequence `s` | Result |
//! |------------------------|--------|
//! | `s <= last`            | `AlreadyPresent` |
//! | `s` in promised        | `AlreadyPromised` |
//! | `s > last + depth`     | `MissingPrevious` |
//! | otherwise              | `Valid` |
//!
//! Each origin sits behind its own mutex; the origin table itself is only
//! write-locked to insert an origin seen for the first time.
//!
//! # Persistence
//!
//! When opened with a path, every commit rewrites a small snapshot (last
//! committed sequence and metadata offset per origin) through
//! [`atomic_write`](crate::atomic_io::atomic_write), so validation resumes after
//! a restart without replaying the storage log.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    atomic_io::{atomic_write, read_if_exists},
    error::{CommitError, Result},
    tx_id::{NodeId, TransactionId},
};

/// Classification of a candidate id against the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationResult {
    /// Sequence already committed.
    AlreadyPresent,
    /// A pending context already holds this id.
    AlreadyPromised,
    /// A predecessor has not been committed yet.
    MissingPrevious,
    /// Acceptable as the next id, or within the pipeline window.
    Valid,
}

/// Durable metadata bound to a committed id.
///
/// Handed to the storage engine together with the write it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMetadata {
    pub tx_id: TransactionId,
    /// Monotonic position of this commit in the local log.
    pub offset: u64,
}

#[derive(Debug, Default)]
struct OriginSlot {
    last_committed: u64,
    last_offset: u64,
    promised: BTreeSet<u64>,
    next_issue: u64,
    recycled: BTreeSet<u64>,
}

impl OriginSlot {
    fn classify(&self, sequence: u64, depth: u64) -> ValidationResult {
        if sequence <= self.last_committed {
            ValidationResult::AlreadyPresent
        } else if self.promised.contains(&sequence) {
            ValidationResult::AlreadyPromised
        } else if sequence > self.last_committed.saturating_add(depth) {
            ValidationResult::MissingPrevious
        } else {
            ValidationResult::Valid
        }
    }
}

/// Serialized form of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    /// `origin -> (last committed sequence, metadata offset)`.
    pub origins: BTreeMap<NodeId, (u64, u64)>,
    pub next_offset: u64,
}

/// Committed and promised transaction ids for every origin.
#[derive(Debug)]
pub struct TransactionLog {
    local_origin: NodeId,
    pipeline_depth: u64,
    origins: RwLock<HashMap<NodeId, Arc<Mutex<OriginSlot>>>>,
    next_offset: AtomicU64,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl TransactionLog {
    /// In-memory log for `local_origin`.
    pub fn new(local_origin: NodeId, pipeline_depth: u64) -> Self {
        Self {
            local_origin,
            pipeline_depth: pipeline_depth.max(1),
            origins: RwLock::new(HashMap::new()),
            next_offset: AtomicU64::new(1),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a persistent log, restoring any snapshot found at `path`.
    pub fn open(local_origin: NodeId, pipeline_depth: u64, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut log = Self::new(local_origin, pipeline_depth);

        if let Some(bytes) = read_if_exists(&path)? {
            let snapshot: LogSnapshot = bincode::deserialize(&bytes)?;
            tracing::info!(
                path = %path.display(),
                origins = snapshot.origins.len(),
                "Restored transaction log"
            );
            log.restore(&snapshot);
        }

        log.path = Some(path);
        Ok(log)
    }

    fn restore(&self, snapshot: &LogSnapshot) {
        let mut origins = self.origins.write();
        for (origin, (last, offset)) in &snapshot.origins {
            let slot = OriginSlot {
                last_committed: *last,
                last_offset: *offset,
                next_issue: last + 1,
                ..OriginSlot::default()
            };
            origins.insert(*origin, Arc::new(Mutex::new(slot)));
        }
        self.next_offset
            .store(snapshot.next_offset.max(1), Ordering::SeqCst);
    }

    fn slot(&self, origin: NodeId) -> Arc<Mutex<OriginSlot>> {
        if let Some(slot) = self.origins.read().get(&origin) {
            return Arc::clone(slot);
        }
        let mut origins = self.origins.write();
        Arc::clone(origins.entry(origin).or_insert_with(|| {
            Arc::new(Mutex::new(OriginSlot {
                next_issue: 1,
                ..OriginSlot::default()
            }))
        }))
    }

    /// Read `origin` without registering it; an unseen origin reads as empty.
    fn read_slot<T>(&self, origin: NodeId, f: impl FnOnce(&OriginSlot) -> T) -> T {
        let slot = self.origins.read().get(&origin).cloned();
        match slot {
            Some(slot) => f(&*slot.lock()),
            None => f(&OriginSlot::default()),
        }
    }

    pub fn local_origin(&self) -> NodeId {
        self.local_origin
    }

    /// Issue the next id for the local origin.
    pub fn next_id(&self) -> TransactionId {
        let slot = self.slot(self.local_origin);
        let mut slot = slot.lock();

        while let Some(seq) = slot.recycled.pop_first() {
            if seq > slot.last_committed && !slot.promised.contains(&seq) {
                return TransactionId::new(self.local_origin, seq);
            }
        }

        let seq = slot.next_issue.max(slot.last_committed + 1);
        slot.next_issue = seq + 1;
        TransactionId::new(self.local_origin, seq)
    }

    /// Give back a locally issued id whose attempt will not commit.
    pub fn release_id(&self, id: TransactionId) {
        if id.origin != self.local_origin {
            return;
        }
        let slot = self.slot(id.origin);
        let mut slot = slot.lock();
        if id.sequence > slot.last_committed && !slot.promised.contains(&id.sequence) {
            slot.recycled.insert(id.sequence);
        }
    }

    /// Classify `id` without changing any state.
    pub fn validate(&self, id: TransactionId) -> ValidationResult {
        self.read_slot(id.origin, |slot| slot.classify(id.sequence, self.pipeline_depth))
    }

    /// Validate `id` and, if valid, promise it to the caller atomically.
    pub fn try_promise(&self, id: TransactionId) -> Result<()> {
        let slot = self.slot(id.origin);
        let mut slot = slot.lock();
        match slot.classify(id.sequence, self.pipeline_depth) {
            ValidationResult::Valid => {
                slot.promised.insert(id.sequence);
                Ok(())
            },
            ValidationResult::AlreadyPresent => Err(CommitError::AlreadyPresent(id)),
            result => Err(CommitError::InvalidSequence { tx_id: id, result }),
        }
    }

    /// Mark `id` as promised regardless of its window position.
    ///
    /// Used for the second id of a DDL pair, which is legitimately ahead of the
    /// last committed sequence until the first id commits.
    pub fn mark_promised(&self, id: TransactionId) {
        let slot = self.slot(id.origin);
        let mut slot = slot.lock();
        if id.sequence > slot.last_committed {
            slot.promised.insert(id.sequence);
        }
    }

    /// Drop a promise made by a context that is being destroyed.
    pub fn release_promise(&self, id: TransactionId) {
        let slot = self.slot(id.origin);
        slot.lock().promised.remove(&id.sequence);
    }

    /// Mark `id` committed and return the metadata for its storage write.
    ///
    /// Fails with `AlreadyPresent` for an id at or below the last committed
    /// sequence and with `MissingPrevious` when its predecessor is still open.
    pub fn commit(&self, id: TransactionId) -> Result<TxMetadata> {
        let metadata = {
            let slot = self.slot(id.origin);
            let mut slot = slot.lock();

            if id.sequence <= slot.last_committed {
                return Err(CommitError::AlreadyPresent(id));
            }
            if id.sequence != slot.last_committed + 1 {
                return Err(CommitError::InvalidSequence {
                    tx_id: id,
                    result: ValidationResult::MissingPrevious,
                });
            }

            let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
            slot.last_committed = id.sequence;
            slot.last_offset = offset;
            slot.promised.remove(&id.sequence);
            slot.next_issue = slot.next_issue.max(id.sequence + 1);
            slot.recycled = slot.recycled.split_off(&(id.sequence + 1));

            TxMetadata { tx_id: id, offset }
        };

        tracing::debug!(tx_id = %id, offset = metadata.offset, "Transaction id committed");
        self.persist()?;
        Ok(metadata)
    }

    /// Last committed id for `origin`, if any.
    pub fn last_committed(&self, origin: NodeId) -> Option<TransactionId> {
        let last = self.read_slot(origin, |slot| slot.last_committed);
        (last > 0).then(|| TransactionId::new(origin, last))
    }

    /// Number of ids currently promised for `origin`.
    pub fn promised_count(&self, origin: NodeId) -> usize {
        self.read_slot(origin, |slot| slot.promised.len())
    }

    pub fn snapshot(&self) -> LogSnapshot {
        let origins = self
            .origins
            .read()
            .iter()
            .map(|(origin, slot)| {
                let slot = slot.lock();
                (*origin, (slot.last_committed, slot.last_offset))
            })
            .filter(|(_, (last, _))| *last > 0)
            .collect();

        LogSnapshot {
            origins,
            next_offset: self.next_offset.load(Ordering::SeqCst),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();
        let bytes = bincode::serialize(&self.snapshot())?;
        atomic_write(path, &bytes)?;
        Ok(())
    }
}
