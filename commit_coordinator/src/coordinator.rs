// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Two-phase commit coordinator for replicated data transactions.
//!
//! # Protocol
//!
//! ```text
//! origin                                   participant
//!   |  validate records, check quorum
//!   |  phase 1 locally (promise id, pre-allocate ids, lock, checks)
//!   |---- FirstPhase(request, tx_id, tx) ---->|  phase 1 (lock, pre-allocate, checks)
//!   |<--------------- Success / Exception ----|
//!   |  quorum decision
//!   |---- SecondPhase(request, commit) ------>|  commit(request) / rollback(request)
//!   |  commit(request) locally
//! ```
//!
//! Phase 1 of an attempt runs in a fixed order:
//!
//! 1. promise the transaction id in the [`TransactionLog`]
//! 2. pre-allocate record ids (before locking on the origin, after on replicas)
//! 3. take every lock in [`LockKey`](crate::lock_manager::LockKey) order
//! 4. duplicate-key check for unique indexes
//! 5. version check for updated and deleted records
//!
//! The attempt's [`TxContext`] holds everything acquired on the way, so any
//! early return gives it all back.
//!
//! # Resolution
//!
//! A participant registers a context even when phase 1 fails, so that the
//! second phase can still resolve it. [`DistributedDatabase::commit`] on a
//! failed or timed out context re-runs phase 1 with fresh contexts a bounded
//! number of times and, when that does not converge, requests a full resync
//! rather than leave the replica diverged.

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use crate::{
    config::CoordinatorConfig,
    context::{ContextPayload, ContextRegistry, TxContext, TxStatus},
    error::{CommitError, Result},
    lock_manager::{lock_keys_for, LockManager},
    membership::{ClusterMembership, ExecutionMode, RemoteTask, TaskHandler},
    metrics::{CoordinatorStats, CoordinatorStatsSnapshot},
    quorum::{QuorumResponseManager, TxResultPayload},
    retry::RetryController,
    storage::{IndexManager, LocalStorage},
    transaction::{ClientTransaction, IndexOperation, OperationKind, RecordId},
    tx_id::{RequestId, TransactionId},
    tx_log::{TransactionLog, ValidationResult},
};

/// Request id used for contexts created by delta synchronization.
pub const SYNC_REQUEST: RequestId = RequestId::new(u32::MAX, u64::MAX);

/// A transaction that reached every replica in its write quorum.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTransaction {
    pub tx_id: TransactionId,
    /// The change set with final record ids.
    pub transaction: ClientTransaction,
}

/// One replicated database on one node.
pub struct DistributedDatabase {
    pub(crate) name: String,
    pub(crate) config: CoordinatorConfig,
    pub(crate) log: Arc<TransactionLog>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) contexts: ContextRegistry,
    pub(crate) storage: Arc<dyn LocalStorage>,
    pub(crate) membership: Arc<dyn ClusterMembership>,
    pub(crate) retry: RetryController,
    pub(crate) stats: CoordinatorStats,
}

impl std::fmt::Debug for DistributedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedDatabase")
            .field("name", &self.name)
            .field("node", &self.membership.local_node_name())
            .field("contexts", &self.contexts.len())
            .field("locks", &self.locks.active_lock_count())
            .finish_non_exhaustive()
    }
}

impl DistributedDatabase {
    pub fn new(
        name: &str,
        config: CoordinatorConfig,
        storage: Arc<dyn LocalStorage>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Result<Self> {
        config.validate()?;

        let origin = membership.local_node_id();
        let log = match &config.log_path {
            Some(path) => TransactionLog::open(origin, config.pipeline_depth, path)?,
            None => TransactionLog::new(origin, config.pipeline_depth),
        };

        tracing::info!(
            db = name,
            node = membership.local_node_name(),
            origin,
            max_auto_retry = config.max_auto_retry,
            lock_timeout_ms = config.lock_timeout_ms,
            "Distributed database opened"
        );

        Ok(Self {
            name: name.to_string(),
            retry: RetryController::new(config.max_auto_retry, config.auto_retry_delay_ms),
            locks: Arc::new(LockManager::new(config.lock_timeout())),
            log: Arc::new(log),
            contexts: ContextRegistry::new(),
            stats: CoordinatorStats::new(),
            config,
            storage,
            membership,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId::new(
            self.membership.local_node_id(),
            self.membership.next_message_id(),
        )
    }

    pub(crate) fn new_context(&self, request_id: RequestId, payload: ContextPayload) -> TxContext {
        TxContext::new(
            request_id,
            payload,
            Arc::clone(&self.locks),
            Arc::clone(&self.log),
            Arc::clone(&self.storage),
        )
    }

    fn record_failure(&self, err: &CommitError) {
        if err.is_conflict() {
            CoordinatorStats::incr(&self.stats.conflicts);
        } else if matches!(err, CommitError::LockTimeout { .. }) {
            CoordinatorStats::incr(&self.stats.lock_timeouts);
        }
    }

    /// Ask a healthy peer for a full copy of the database.
    pub(crate) fn escalate_resync(&self, request_id: RequestId) {
        CoordinatorStats::incr(&self.stats.resyncs);
        tracing::warn!(
            db = %self.name,
            request_id = %request_id,
            "Forcing database resync"
        );
        if let Err(err) = self.membership.request_full_sync(&self.name) {
            tracing::error!(db = %self.name, error = %err, "Resync request failed");
        }
    }

    /// Run phase 1 of the data transaction held by `ctx`.
    ///
    /// `local` is true on the origin, which allocates record ids before
    /// locking; replicas reserve the origin's ids after locking.
    fn begin_phase1(&self, ctx: &mut TxContext, local: bool) -> Result<()> {
        ctx.promise(ctx.tx_id())?;

        if local {
            ctx.preallocate()?;
        }

        let tx = ctx
            .transaction()
            .ok_or_else(|| CommitError::InvalidState("not a data transaction".to_string()))?;
        let keys = lock_keys_for(tx, self.storage.indexes())?;
        ctx.acquire(&keys)?;
        tracing::debug!(
            request_id = %ctx.request_id(),
            tx_id = %ctx.tx_id(),
            locks = keys.len(),
            "Locks acquired"
        );

        if !local {
            ctx.preallocate()?;
        }

        let tx = ctx
            .transaction()
            .ok_or_else(|| CommitError::InvalidState("not a data transaction".to_string()))?;
        check_unique_keys(tx, self.storage.indexes())?;
        check_versions(tx, self.storage.as_ref())?;
        Ok(())
    }

    /// Phase 1 on behalf of `request_id`.
    ///
    /// Returns `Ok(false)` when the conflict means this replica is behind and
    /// the request should be delivered again later. Any other failure
    /// registers a failed (or timed out) context, so that the second phase can
    /// still resolve it, and is returned.
    pub fn begin_distributed_transaction(
        &self,
        request_id: RequestId,
        tx_id: TransactionId,
        transaction: ClientTransaction,
        local: bool,
        retry_count: u32,
    ) -> Result<bool> {
        CoordinatorStats::incr(&self.stats.started);
        let mut ctx = self.new_context(request_id, ContextPayload::Data { tx_id, transaction });

        let started = Instant::now();
        let result = self.begin_phase1(&mut ctx, local);
        self.stats.phase1_timing.record(started.elapsed());

        match result {
            Ok(()) => {
                ctx.set_status(TxStatus::Success);
                self.contexts.register(ctx);
                tracing::debug!(request_id = %request_id, tx_id = %tx_id, "Phase 1 succeeded");
                Ok(true)
            },
            Err(err) => {
                self.record_failure(&err);
                if err.should_requeue() && retry_count < self.config.max_auto_retry {
                    tracing::debug!(
                        request_id = %request_id,
                        tx_id = %tx_id,
                        retry_count,
                        error = %err,
                        "Waiting for re-enqueue"
                    );
                    ctx.destroy();
                    return Ok(false);
                }

                tracing::debug!(
                    request_id = %request_id,
                    tx_id = %tx_id,
                    error = %err,
                    "Phase 1 failed"
                );
                ctx.fail(err.clone());
                self.contexts.register(ctx);
                Err(err)
            },
        }
    }

    fn apply(&self, ctx: &mut TxContext) -> Result<()> {
        let tx = ctx
            .transaction()
            .ok_or_else(|| CommitError::InvalidState("not a data transaction".to_string()))?;
        let metadata = self.log.commit(ctx.tx_id())?;
        self.storage.commit_preallocated(tx, &metadata)?;
        ctx.mark_applied();
        Ok(())
    }

    /// Apply a resolved context, treating an already committed id as done.
    fn commit_context(&self, mut ctx: TxContext) -> Result<()> {
        let started = Instant::now();
        let result = self.apply(&mut ctx);
        self.stats.commit_timing.record(started.elapsed());

        match result {
            Ok(()) => {
                CoordinatorStats::incr(&self.stats.committed);
                tracing::debug!(
                    request_id = %ctx.request_id(),
                    tx_id = %ctx.tx_id(),
                    "Transaction committed"
                );
                Ok(())
            },
            Err(CommitError::AlreadyPresent(tx_id)) => {
                tracing::debug!(tx_id = %tx_id, "Transaction already committed");
                Ok(())
            },
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id(),
                    tx_id = %ctx.tx_id(),
                    error = %err,
                    "Commit failed"
                );
                let request_id = ctx.request_id();
                drop(ctx);
                self.escalate_resync(request_id);
                Err(err)
            },
        }
    }

    /// Second phase: make the transaction of `request_id` durable.
    ///
    /// Returns `Ok(false)` when no context is registered for the request.
    pub fn commit(&self, request_id: RequestId) -> Result<bool> {
        let Some(ctx) = self.contexts.pop(request_id) else {
            return Ok(false);
        };

        if ctx.status() == TxStatus::Success {
            self.commit_context(ctx)?;
            return Ok(true);
        }

        let tx_id = ctx.tx_id();
        let transaction = ctx
            .transaction()
            .cloned()
            .ok_or_else(|| CommitError::InvalidState("not a data transaction".to_string()))?;
        tracing::info!(
            request_id = %request_id,
            tx_id = %tx_id,
            status = ?ctx.status(),
            "Resolving unsuccessful first phase"
        );
        drop(ctx);

        let mut resolved = None;
        for attempt in 1..=self.config.max_auto_retry {
            self.retry.pause(attempt);
            CoordinatorStats::incr(&self.stats.retries);

            match self.log.validate(tx_id) {
                ValidationResult::AlreadyPresent => {
                    tracing::debug!(tx_id = %tx_id, "Already committed while resolving");
                    return Ok(true);
                },
                ValidationResult::MissingPrevious => continue,
                ValidationResult::AlreadyPromised | ValidationResult::Valid => {},
            }

            let mut ctx = self.new_context(
                request_id,
                ContextPayload::Data {
                    tx_id,
                    transaction: transaction.clone(),
                },
            );
            match self.begin_phase1(&mut ctx, false) {
                Ok(()) => {
                    ctx.set_status(TxStatus::Success);
                    resolved = Some(ctx);
                    break;
                },
                Err(err @ CommitError::LockTimeout { .. }) => {
                    self.record_failure(&err);
                },
                Err(err @ CommitError::InvalidSequence { .. }) => {
                    tracing::debug!(tx_id = %tx_id, error = %err, "Sequence not settled yet");
                },
                Err(err) => {
                    tracing::warn!(
                        request_id = %request_id,
                        tx_id = %tx_id,
                        error = %err,
                        "Error beginning timed out transaction"
                    );
                    break;
                },
            }
        }

        match resolved {
            Some(ctx) => {
                self.commit_context(ctx)?;
            },
            None => {
                tracing::warn!(
                    request_id = %request_id,
                    tx_id = %tx_id,
                    "Reached retry limit for commit"
                );
                self.escalate_resync(request_id);
            },
        }
        Ok(true)
    }

    /// Discard the context of `request_id` without applying anything.
    ///
    /// Returns whether a context was registered.
    pub fn rollback(&self, request_id: RequestId) -> bool {
        match self.contexts.pop(request_id) {
            Some(mut ctx) => {
                ctx.destroy();
                CoordinatorStats::incr(&self.stats.rolled_back);
                tracing::debug!(request_id = %request_id, "Transaction rolled back");
                true
            },
            None => false,
        }
    }

    /// Submit a locally assembled transaction to the cluster.
    ///
    /// Records are validated first; local validation failures are never
    /// retried. Each attempt uses a fresh transaction id, and retryable
    /// conflicts are retried by the [`RetryController`].
    pub fn commit_transaction(&self, transaction: ClientTransaction) -> Result<CommittedTransaction> {
        for op in &transaction.operations {
            if op.kind != OperationKind::Deleted {
                self.storage.validate_record(op)?;
            }
        }

        self.retry.run(|attempt| {
            if attempt > 1 {
                CoordinatorStats::incr(&self.stats.retries);
            }
            let tx_id = self.log.next_id();
            let result = self.submit(tx_id, transaction.clone());
            if result.is_err() {
                self.log.release_id(tx_id);
            }
            result
        })
    }

    fn submit(&self, tx_id: TransactionId, transaction: ClientTransaction) -> Result<CommittedTransaction> {
        let nodes = self.membership.available_node_names(&self.name);
        let quorum = self
            .config
            .replication
            .max_write_quorum(transaction.involved_clusters(), nodes.len());
        if quorum > nodes.len() {
            CoordinatorStats::incr(&self.stats.insufficient_nodes);
            tracing::warn!(
                db = %self.name,
                quorum,
                available = nodes.len(),
                "Not enough nodes online"
            );
            return Err(CommitError::InsufficientNodes {
                quorum,
                available: nodes.len(),
                online: nodes,
            });
        }

        let request_id = self.next_request_id();
        CoordinatorStats::incr(&self.stats.started);
        let mut ctx = self.new_context(request_id, ContextPayload::Data { tx_id, transaction });

        let started = Instant::now();
        let phase1 = self.begin_phase1(&mut ctx, true);
        self.stats.phase1_timing.record(started.elapsed());
        if let Err(err) = phase1 {
            self.record_failure(&err);
            return Err(err);
        }
        ctx.set_status(TxStatus::Success);

        let transaction = ctx
            .transaction()
            .cloned()
            .ok_or_else(|| CommitError::InvalidState("not a data transaction".to_string()))?;
        let local = self.membership.local_node_name().to_string();
        let targets: BTreeSet<String> = nodes.iter().filter(|n| **n != local).cloned().collect();

        if targets.is_empty() {
            self.commit_context(ctx)?;
            return Ok(CommittedTransaction { tx_id, transaction });
        }

        let responses = QuorumResponseManager::new(request_id, nodes.clone(), nodes.len(), quorum);
        responses.receive(&local, TxResultPayload::Success);
        self.contexts.register(ctx);

        let first_phase = RemoteTask::FirstPhase {
            request_id,
            tx_id,
            transaction: transaction.clone(),
        };
        if let Err(err) = self.membership.send_request(
            &self.name,
            &targets,
            &first_phase,
            ExecutionMode::Response,
            &responses,
        ) {
            self.rollback(request_id);
            return Err(err);
        }

        let outcome = responses.outcome();
        let commit = matches!(outcome, Ok(TxResultPayload::Success));
        tracing::debug!(
            request_id = %request_id,
            tx_id = %tx_id,
            quorum,
            responses = responses.response_count(),
            commit,
            "Quorum decision"
        );

        let second_phase = RemoteTask::SecondPhase { request_id, commit };
        let acks = QuorumResponseManager::new(request_id, targets.clone(), targets.len(), 0);
        if let Err(err) = self.membership.send_request(
            &self.name,
            &targets,
            &second_phase,
            ExecutionMode::NoResponse,
            &acks,
        ) {
            tracing::warn!(request_id = %request_id, error = %err, "Second phase delivery failed");
        }

        if commit {
            self.commit(request_id)?;
            return Ok(CommittedTransaction { tx_id, transaction });
        }

        self.rollback(request_id);
        Err(match outcome {
            Ok(TxResultPayload::InvalidSequence { tx_id, result }) => {
                CommitError::InvalidSequence { tx_id, result }
            },
            Ok(TxResultPayload::Exception(err)) | Err(err) => err,
            Ok(TxResultPayload::Success) => {
                CommitError::InvalidState("quorum reached without commit".to_string())
            },
        })
    }

    /// Apply a transaction received through delta synchronization.
    ///
    /// No locks are taken and nothing is broadcast. An id that is already
    /// committed is skipped.
    pub fn sync_commit(&self, tx_id: TransactionId, transaction: ClientTransaction) -> Result<()> {
        if self.log.validate(tx_id) == ValidationResult::AlreadyPresent {
            tracing::debug!(tx_id = %tx_id, "Sync transaction already present");
            return Ok(());
        }

        let mut ctx = self.new_context(SYNC_REQUEST, ContextPayload::Data { tx_id, transaction });
        ctx.preallocate()?;
        ctx.set_status(TxStatus::Success);
        self.apply(&mut ctx)?;
        CoordinatorStats::incr(&self.stats.committed);
        Ok(())
    }

    /// Destroy every pending context, releasing its locks.
    pub fn close(&self) {
        self.contexts.destroy_all();
    }

    fn handle_first_phase(
        &self,
        request_id: RequestId,
        tx_id: TransactionId,
        transaction: ClientTransaction,
    ) -> TxResultPayload {
        let mut retry_count = 0;
        loop {
            match self.begin_distributed_transaction(
                request_id,
                tx_id,
                transaction.clone(),
                false,
                retry_count,
            ) {
                Ok(true) => return TxResultPayload::Success,
                Ok(false) => {
                    retry_count += 1;
                    self.retry.pause(retry_count + 1);
                },
                Err(err) => return TxResultPayload::from(Err(err)),
            }
        }
    }
}

impl TaskHandler for DistributedDatabase {
    fn handle_task(&self, sender: &str, task: RemoteTask) -> TxResultPayload {
        tracing::trace!(
            db = %self.name,
            sender,
            task = task.name(),
            request_id = %task.request_id(),
            "Handling task"
        );
        match task {
            RemoteTask::FirstPhase {
                request_id,
                tx_id,
                transaction,
            } => self.handle_first_phase(request_id, tx_id, transaction),
            RemoteTask::SecondPhase {
                request_id,
                commit: true,
            } => match self.commit(request_id) {
                Ok(_) => TxResultPayload::Success,
                Err(err) => TxResultPayload::Exception(err),
            },
            RemoteTask::SecondPhase {
                request_id,
                commit: false,
            } => {
                self.rollback(request_id);
                TxResultPayload::Success
            },
            RemoteTask::DdlFirstPhase {
                request_id,
                query,
                before,
                after,
            } => self.first_phase_ddl(&query, before, after, request_id),
            RemoteTask::DdlSecondPhase { request_id, apply } => {
                TxResultPayload::from(self.second_phase_ddl(request_id, apply))
            },
        }
    }
}

/// Reject index changes that would give a unique key a second record.
///
/// The key's current record may only be replaced when the same change set
/// also removes it from that key.
pub fn check_unique_keys(tx: &ClientTransaction, indexes: &dyn IndexManager) -> Result<()> {
    for (name, changes) in &tx.index_changes {
        let unique = indexes.index_type(name).is_some_and(|t| t.is_unique());
        if !unique {
            continue;
        }

        for (key, entries) in changes.keys() {
            let Some(last) = entries.last() else {
                continue;
            };
            let Some(incoming) = last.value.filter(|_| last.operation == IndexOperation::Put)
            else {
                continue;
            };
            let Some(existing) = indexes.current_value(name, key) else {
                continue;
            };
            if existing == incoming {
                continue;
            }

            let removed = entries.iter().any(|e| {
                e.operation == IndexOperation::Remove && e.value == Some(existing)
            });
            if !removed {
                return Err(CommitError::DuplicateKey {
                    index: name.clone(),
                    key: key.map(str::to_string),
                    existing,
                    incoming,
                });
            }
        }
    }
    Ok(())
}

/// Compare the writer's record versions with storage.
pub fn check_versions(tx: &ClientTransaction, storage: &dyn LocalStorage) -> Result<()> {
    for op in tx.operations.iter().filter(|op| op.kind != OperationKind::Created) {
        if storage.is_deleted(op.rid) {
            return Err(CommitError::ConcurrentModification {
                rid: op.rid,
                stored_version: op.version,
                expected_version: op.version,
            });
        }
        match storage.record_metadata(op.rid) {
            None => {
                return Err(CommitError::ConcurrentCreate {
                    expected: op.rid,
                    actual: RecordId::new(-1, -1),
                });
            },
            Some(metadata) if metadata.version != op.version => {
                return Err(CommitError::ConcurrentModification {
                    rid: op.rid,
                    stored_version: metadata.version,
                    expected_version: op.version,
                });
            },
            Some(_) => {},
        }
    }
    Ok(())
}
