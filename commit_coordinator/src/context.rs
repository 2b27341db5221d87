// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Per-attempt transaction state.
//!
//! A [`TxContext`] is created for one attempt to commit a data transaction or
//! a DDL pair. It owns everything the attempt holds:
//!
//! - the record and index-key locks taken in the [`LockManager`]
//! - the transaction ids promised in the [`TransactionLog`]
//! - the record positions reserved in [`LocalStorage`]
//!
//! All three are given back by [`TxContext::destroy`], which is idempotent and
//! also runs on `Drop`, so every exit path of an attempt releases them exactly
//! once.
//!
//! # Status
//!
//! ```text
//!            +--> Success --(commit/rollback)--> destroyed
//! Pending ---+--> Failed   (locks released)
//!            +--> TimedOut (locks released, outcome unknown)
//! ```
//!
//! Transitions are one-way. A terminal context is never reused: the commit
//! path builds a fresh context for every retry.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CommitError, Result},
    lock_manager::{LockKey, LockManager},
    storage::LocalStorage,
    transaction::{ClientTransaction, RecordId},
    tx_id::{RequestId, TransactionId},
    tx_log::TransactionLog,
};

/// Status of a transaction context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
    /// A lock wait expired; the cluster-wide outcome is not known yet.
    TimedOut,
}

impl TxStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, TxStatus::Failed | TxStatus::TimedOut)
    }
}

/// What the context is committing.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextPayload {
    Data {
        tx_id: TransactionId,
        transaction: ClientTransaction,
    },
    Ddl {
        query: String,
        before: TransactionId,
        after: TransactionId,
    },
}

/// State of one commit attempt.
pub struct TxContext {
    request_id: RequestId,
    payload: ContextPayload,
    status: TxStatus,
    error: Option<CommitError>,
    locks: Arc<LockManager>,
    log: Arc<TransactionLog>,
    storage: Arc<dyn LocalStorage>,
    held: Vec<LockKey>,
    promised: Vec<TransactionId>,
    preallocated: Vec<RecordId>,
    created_at: Instant,
    destroyed: bool,
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("request_id", &self.request_id)
            .field("tx_id", &self.tx_id())
            .field("status", &self.status)
            .field("held", &self.held)
            .field("promised", &self.promised)
            .finish_non_exhaustive()
    }
}

impl TxContext {
    pub fn new(
        request_id: RequestId,
        payload: ContextPayload,
        locks: Arc<LockManager>,
        log: Arc<TransactionLog>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        Self {
            request_id,
            payload,
            status: TxStatus::Pending,
            error: None,
            locks,
            log,
            storage,
            held: Vec::new(),
            promised: Vec::new(),
            preallocated: Vec::new(),
            created_at: Instant::now(),
            destroyed: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn payload(&self) -> &ContextPayload {
        &self.payload
    }

    /// Transaction id of the attempt; the `before` id for DDL.
    pub fn tx_id(&self) -> TransactionId {
        match &self.payload {
            ContextPayload::Data { tx_id, .. } => *tx_id,
            ContextPayload::Ddl { before, .. } => *before,
        }
    }

    pub fn transaction(&self) -> Option<&ClientTransaction> {
        match &self.payload {
            ContextPayload::Data { transaction, .. } => Some(transaction),
            ContextPayload::Ddl { .. } => None,
        }
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Error that moved the context to `Failed` or `TimedOut`.
    pub fn error(&self) -> Option<&CommitError> {
        self.error.as_ref()
    }

    pub fn held_locks(&self) -> &[LockKey] {
        &self.held
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Validate `id` and promise it to this context.
    pub fn promise(&mut self, id: TransactionId) -> Result<()> {
        self.log.try_promise(id)?;
        self.promised.push(id);
        Ok(())
    }

    /// Promise `id` without window validation (second id of a DDL pair).
    pub fn mark_promised(&mut self, id: TransactionId) {
        self.log.mark_promised(id);
        self.promised.push(id);
    }

    /// Take `keys` in the given order, blocking on each.
    ///
    /// Keys taken before a failure stay recorded so teardown releases them.
    pub fn acquire(&mut self, keys: &[LockKey]) -> Result<()> {
        for key in keys {
            self.locks.lock(key, self.request_id)?;
            if !self.held.contains(key) {
                self.held.push(key.clone());
            }
        }
        Ok(())
    }

    /// Fix the final ids of records created by the transaction.
    pub fn preallocate(&mut self) -> Result<()> {
        let ContextPayload::Data { transaction, .. } = &mut self.payload else {
            return Ok(());
        };
        let reserved = self.storage.preallocate_record_ids(transaction)?;
        self.preallocated.extend(reserved);
        Ok(())
    }

    /// Move out of `Pending`. Returns false if the context was already
    /// resolved.
    ///
    /// Failing statuses give back locks, promises and reservations at once.
    pub fn set_status(&mut self, status: TxStatus) -> bool {
        if self.status != TxStatus::Pending || status == TxStatus::Pending {
            return false;
        }
        self.status = status;
        if status.is_terminal_failure() {
            self.release_resources();
        }
        true
    }

    /// Record `err` and move to `TimedOut` for lock timeouts, `Failed`
    /// otherwise.
    pub fn fail(&mut self, err: CommitError) {
        let status = if matches!(err, CommitError::LockTimeout { .. }) {
            TxStatus::TimedOut
        } else {
            TxStatus::Failed
        };
        if self.set_status(status) {
            self.error = Some(err);
        }
    }

    /// Forget promises and reservations consumed by a successful apply.
    pub fn mark_applied(&mut self) {
        self.promised.clear();
        self.preallocated.clear();
    }

    pub fn release_locks(&mut self) {
        if !self.held.is_empty() {
            self.locks.unlock_all(&self.held, self.request_id);
            self.held.clear();
        }
    }

    fn release_resources(&mut self) {
        self.release_locks();
        for id in self.promised.drain(..) {
            self.log.release_promise(id);
        }
        if !self.preallocated.is_empty() {
            self.storage.release_preallocated(&self.preallocated);
            self.preallocated.clear();
        }
    }

    /// Release everything the context holds. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.release_resources();
        self.destroyed = true;
        tracing::trace!(
            request_id = %self.request_id,
            status = ?self.status,
            age_ms = self.age().as_millis() as u64,
            "Context destroyed"
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for TxContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Contexts of one database, keyed by the request that created them.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<RequestId, TxContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `context`, destroying any context it replaces.
    pub fn register(&self, context: TxContext) {
        let replaced = self.contexts.lock().insert(context.request_id(), context);
        if let Some(mut old) = replaced {
            tracing::warn!(request_id = %old.request_id(), "Replacing registered context");
            old.destroy();
        }
    }

    /// Remove and return the context for `request_id`.
    pub fn pop(&self, request_id: RequestId) -> Option<TxContext> {
        self.contexts.lock().remove(&request_id)
    }

    pub fn status(&self, request_id: RequestId) -> Option<TxStatus> {
        self.contexts.lock().get(&request_id).map(TxContext::status)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.contexts.lock().contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }

    /// Destroy every registered context.
    pub fn destroy_all(&self) {
        let drained: Vec<TxContext> = self.contexts.lock().drain().map(|(_, c)| c).collect();
        drop(drained);
    }
}
