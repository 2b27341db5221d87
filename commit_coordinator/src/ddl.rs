//! Replicated schema commands.
//!
//! A schema command is bracketed by two transaction ids issued by its origin,
//! `before` and `after`, so every replica runs it at the same point of the
//! origin's commit order:
//!
//! ```text
//! commit(before) -> execute command -> commit(after)
//! ```
//!
//! Phase 1 only validates the pair and parks a context; the command body runs
//! in phase 2 and at most once per replica and request.

use std::collections::BTreeSet;

use crate::{
    context::{ContextPayload, TxContext, TxStatus},
    coordinator::DistributedDatabase,
    error::{CommitError, Result},
    membership::{ExecutionMode, RemoteTask},
    metrics::CoordinatorStats,
    quorum::{QuorumResponseManager, TxResultPayload},
    retry,
    storage::RunMode,
    tx_id::{NodeId, RequestId, TransactionId},
    tx_log::ValidationResult,
};

/// Whether a `(before, after)` pair must be rejected by a replica.
///
/// Rejected when either id is already committed here, or when neither id can
/// be applied yet (both promised elsewhere or waiting on a predecessor).
pub fn ddl_sequence_conflict(before: ValidationResult, after: ValidationResult) -> bool {
    let blocked = |r: ValidationResult| {
        matches!(
            r,
            ValidationResult::AlreadyPromised | ValidationResult::MissingPrevious
        )
    };
    before == ValidationResult::AlreadyPresent
        || after == ValidationResult::AlreadyPresent
        || (blocked(before) && blocked(after))
}

/// Action the origin takes after collecting phase 1 responses.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlDecision {
    /// Quorum agreed: apply everywhere.
    Apply,
    /// Abort and start again with fresh ids.
    Retry(CommitError),
    /// Abort and report the error.
    Abort(CommitError),
}

/// Decide the second phase of a schema command from its phase 1 round.
pub fn decide_ddl(responses: &QuorumResponseManager) -> DdlDecision {
    match responses.final_response() {
        Some(TxResultPayload::Success) => DdlDecision::Apply,
        Some(TxResultPayload::InvalidSequence { tx_id, result }) => {
            DdlDecision::Retry(CommitError::InvalidSequence { tx_id, result })
        },
        Some(TxResultPayload::Exception(err)) => DdlDecision::Abort(err),
        None => {
            let invalid = responses.all_responses().into_iter().find_map(|(_, p)| match p {
                TxResultPayload::InvalidSequence { tx_id, result } => {
                    Some(CommitError::InvalidSequence { tx_id, result })
                },
                _ => None,
            });
            DdlDecision::Retry(invalid.unwrap_or_else(|| CommitError::QuorumNotReached {
                request: responses.request_id(),
                quorum: responses.quorum(),
                responses: responses.describe(),
            }))
        },
    }
}

/// Ids of `origin` that some replica reports as already committed.
///
/// Those ids were committed elsewhere and must never be issued again.
fn committed_elsewhere(responses: &QuorumResponseManager, origin: NodeId) -> Vec<TransactionId> {
    responses
        .all_responses()
        .into_iter()
        .filter_map(|(_, payload)| match payload {
            TxResultPayload::InvalidSequence {
                tx_id,
                result: ValidationResult::AlreadyPresent,
            } if tx_id.origin == origin => Some(tx_id),
            _ => None,
        })
        .collect()
}

impl DistributedDatabase {
    /// Run `command` on every replica of the database.
    ///
    /// With [`RunMode::Replicated`] the caller is already executing on behalf
    /// of a replicated request and the command is applied locally only.
    pub fn run_ddl(&self, command: &str, mode: RunMode) -> Result<()> {
        if mode == RunMode::Replicated {
            return self.storage.execute_command(command, RunMode::Replicated);
        }

        let attempts = self.config.max_auto_retry + 1;
        let mut last = None;
        for attempt in 1..=attempts {
            self.retry.pause(attempt);

            let before = self.log.next_id();
            let after = self.log.next_id();
            match self.ddl_round(command, before, after)? {
                DdlDecision::Apply => {
                    tracing::info!(
                        db = %self.name,
                        command,
                        before = %before,
                        after = %after,
                        "Schema command replicated"
                    );
                    return Ok(());
                },
                DdlDecision::Retry(err) => {
                    tracing::debug!(attempt, command, error = %err, "Retrying schema command");
                    CoordinatorStats::incr(&self.stats.retries);
                    last = Some(err);
                },
                DdlDecision::Abort(err) => return Err(err),
            }
        }

        let last = last.unwrap_or_else(|| {
            CommitError::InvalidState(format!("schema command '{command}' never attempted"))
        });
        Err(retry::exhausted(attempts, last))
    }

    /// One broadcast of the id pair. Ids that did not commit are handed back
    /// to the sequencer, except those a replica reports as already committed.
    fn ddl_round(&self, command: &str, before: TransactionId, after: TransactionId) -> Result<DdlDecision> {
        let request_id = self.next_request_id();
        let mut stale = BTreeSet::new();
        let result = self.ddl_exchange(command, before, after, request_id, &mut stale);
        if matches!(result, Ok(DdlDecision::Apply)) {
            return result;
        }

        for id in [after, before] {
            if !stale.contains(&id) {
                self.log.release_id(id);
            }
        }
        if !stale.is_empty() {
            tracing::warn!(
                request_id = %request_id,
                command,
                ?stale,
                "Replicas already committed ids issued for a schema command"
            );
            self.escalate_resync(request_id);
        }
        result
    }

    fn ddl_exchange(
        &self,
        command: &str,
        before: TransactionId,
        after: TransactionId,
        request_id: RequestId,
        stale: &mut BTreeSet<TransactionId>,
    ) -> Result<DdlDecision> {
        let nodes = self.membership.available_node_names(&self.name);
        let quorum = self
            .config
            .replication
            .max_write_quorum(std::iter::empty(), nodes.len());
        if quorum > nodes.len() {
            CoordinatorStats::incr(&self.stats.insufficient_nodes);
            return Err(CommitError::InsufficientNodes {
                quorum,
                available: nodes.len(),
                online: nodes,
            });
        }

        let local = self.membership.local_node_name().to_string();
        let targets: BTreeSet<String> = nodes.iter().filter(|n| **n != local).cloned().collect();

        let responses = QuorumResponseManager::new(request_id, nodes.clone(), nodes.len(), quorum);
        responses.receive(&local, self.first_phase_ddl(command, before, after, request_id));

        let task = RemoteTask::DdlFirstPhase {
            request_id,
            query: command.to_string(),
            before,
            after,
        };
        if let Err(err) = self.membership.send_request(
            &self.name,
            &targets,
            &task,
            ExecutionMode::Response,
            &responses,
        ) {
            self.confirm_ddl(request_id, &targets, false)?;
            return Err(err);
        }

        stale.extend(committed_elsewhere(&responses, self.log.local_origin()));
        let decision = decide_ddl(&responses);
        self.confirm_ddl(request_id, &targets, decision == DdlDecision::Apply)?;
        Ok(decision)
    }

    fn confirm_ddl(&self, request_id: RequestId, targets: &BTreeSet<String>, apply: bool) -> Result<()> {
        let task = RemoteTask::DdlSecondPhase { request_id, apply };
        let acks = QuorumResponseManager::new(request_id, targets.clone(), targets.len(), 0);
        if let Err(err) = self.membership.send_request(
            &self.name,
            targets,
            &task,
            ExecutionMode::NoResponse,
            &acks,
        ) {
            tracing::warn!(request_id = %request_id, error = %err, "Schema second phase delivery failed");
        }
        self.second_phase_ddl(request_id, apply)
    }

    /// Phase 1 of a schema command: validate the id pair and park a context.
    pub fn first_phase_ddl(
        &self,
        query: &str,
        before: TransactionId,
        after: TransactionId,
        request_id: RequestId,
    ) -> TxResultPayload {
        let first = self.log.validate(before);
        let second = self.log.validate(after);

        let mut ctx = self.new_context(
            request_id,
            ContextPayload::Ddl {
                query: query.to_string(),
                before,
                after,
            },
        );

        if ddl_sequence_conflict(first, second) {
            tracing::debug!(
                request_id = %request_id,
                before = %before,
                after = %after,
                ?first,
                ?second,
                "Schema command out of sequence"
            );
            ctx.set_status(TxStatus::TimedOut);
            self.contexts.register(ctx);
            let (tx_id, result) = if first == ValidationResult::Valid {
                (after, second)
            } else {
                (before, first)
            };
            return TxResultPayload::InvalidSequence { tx_id, result };
        }

        ctx.mark_promised(before);
        ctx.mark_promised(after);
        ctx.set_status(TxStatus::Success);
        self.contexts.register(ctx);
        TxResultPayload::Success
    }

    /// Phase 2 of a schema command.
    ///
    /// A replica whose phase 1 was rejected re-validates a bounded number of
    /// times before falling back to a full resync.
    pub fn second_phase_ddl(&self, request_id: RequestId, apply: bool) -> Result<()> {
        let Some(mut ctx) = self.contexts.pop(request_id) else {
            if apply {
                tracing::warn!(request_id = %request_id, "No schema context to apply");
            }
            return Ok(());
        };
        if !apply {
            ctx.destroy();
            return Ok(());
        }

        let ContextPayload::Ddl { query, before, after } = ctx.payload().clone() else {
            return Err(CommitError::InvalidState(format!(
                "request {request_id} is not a schema command"
            )));
        };

        if ctx.status() == TxStatus::Success {
            return self.apply_ddl(ctx, &query, before, after);
        }
        drop(ctx);

        for attempt in 1..=self.config.max_auto_retry {
            self.retry.pause(attempt + 1);
            let validated = self
                .first_phase_ddl(&query, before, after, request_id)
                .is_success();
            if let (true, Some(ctx)) = (validated, self.contexts.pop(request_id)) {
                return self.apply_ddl(ctx, &query, before, after);
            }
        }

        tracing::warn!(request_id = %request_id, query, "Schema command never validated");
        self.escalate_resync(request_id);
        Ok(())
    }

    fn apply_ddl(
        &self,
        mut ctx: TxContext,
        query: &str,
        before: TransactionId,
        after: TransactionId,
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            let metadata = self.log.commit(before)?;
            self.storage.apply_metadata(&metadata)?;
            self.execute_ddl_body(query)?;
            let metadata = self.log.commit(after)?;
            self.storage.apply_metadata(&metadata)
        })();

        match result {
            Ok(()) => {
                ctx.mark_applied();
                CoordinatorStats::incr(&self.stats.ddl_executed);
                Ok(())
            },
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id(),
                    query,
                    error = %err,
                    "Schema command failed"
                );
                let request_id = ctx.request_id();
                drop(ctx);
                self.escalate_resync(request_id);
                Err(err)
            },
        }
    }

    /// Run the command body once `before` is committed.
    ///
    /// The pair can no longer be re-validated at this point, so the body
    /// itself is retried up to `max_auto_retry` times.
    fn execute_ddl_body(&self, query: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.storage.execute_command(query, RunMode::Replicated) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.max_auto_retry => {
                    tracing::warn!(attempt, query, error = %err, "Schema command body failed, retrying");
                    CoordinatorStats::incr(&self.stats.retries);
                    attempt += 1;
                    self.retry.pause(attempt);
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Create a data cluster on every replica.
    pub fn add_cluster(&self, name: &str) -> Result<()> {
        self.run_ddl(&format!("create cluster `{name}`"), RunMode::Local)
    }

    /// Drop a data cluster on every replica.
    pub fn drop_cluster(&self, name: &str) -> Result<()> {
        self.run_ddl(&format!("drop cluster `{name}`"), RunMode::Local)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::CoordinatorConfig, membership::MemoryCluster, storage::MemoryStorage,
        transaction::ClientTransaction,
    };

    use ValidationResult::*;

    fn single_node() -> (DistributedDatabase, Arc<MemoryStorage>) {
        let cluster = MemoryCluster::new();
        let membership = Arc::new(cluster.join("node-a", 1));
        let storage = Arc::new(MemoryStorage::new());
        let config = CoordinatorConfig::default()
            .with_max_auto_retry(2)
            .with_auto_retry_delay_ms(1);
        let db = DistributedDatabase::new("db", config, storage.clone(), membership).unwrap();
        (db, storage)
    }

    #[test]
    fn test_sequence_conflict_rules() {
        assert!(ddl_sequence_conflict(AlreadyPresent, MissingPrevious));
        assert!(ddl_sequence_conflict(Valid, AlreadyPresent));
        assert!(ddl_sequence_conflict(MissingPrevious, MissingPrevious));
        assert!(ddl_sequence_conflict(AlreadyPromised, MissingPrevious));
        assert!(!ddl_sequence_conflict(Valid, MissingPrevious));
        assert!(!ddl_sequence_conflict(Valid, Valid));
        assert!(!ddl_sequence_conflict(MissingPrevious, Valid));
    }

    #[test]
    fn test_decision_retries_on_invalid_sequence() {
        let request_id = RequestId::new(1, 1);
        let nodes: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let invalid = TxResultPayload::InvalidSequence {
            tx_id: TransactionId::new(1, 5),
            result: AlreadyPresent,
        };

        let qm = QuorumResponseManager::new(request_id, nodes.clone(), 3, 2);
        qm.receive("a", invalid.clone());
        qm.receive("b", invalid.clone());
        qm.receive("c", TxResultPayload::Success);
        assert!(matches!(decide_ddl(&qm), DdlDecision::Retry(_)));

        let qm = QuorumResponseManager::new(request_id, nodes.clone(), 3, 2);
        qm.receive("a", TxResultPayload::Success);
        qm.receive("b", invalid);
        assert!(matches!(
            decide_ddl(&qm),
            DdlDecision::Retry(CommitError::InvalidSequence { .. })
        ));

        let qm = QuorumResponseManager::new(request_id, nodes.clone(), 3, 2);
        qm.receive("a", TxResultPayload::Success);
        assert!(matches!(
            decide_ddl(&qm),
            DdlDecision::Retry(CommitError::QuorumNotReached { .. })
        ));

        let qm = QuorumResponseManager::new(request_id, nodes, 3, 2);
        qm.receive("a", TxResultPayload::Success);
        qm.receive("c", TxResultPayload::Success);
        assert_eq!(decide_ddl(&qm), DdlDecision::Apply);
    }

    #[test]
    fn test_first_phase_rejects_committed_pair() {
        let (db, _) = single_node();
        db.log().commit(TransactionId::new(2, 1)).unwrap();

        let request_id = RequestId::new(2, 9);
        let payload = db.first_phase_ddl(
            "create cluster x",
            TransactionId::new(2, 1),
            TransactionId::new(2, 2),
            request_id,
        );
        assert_eq!(
            payload,
            TxResultPayload::InvalidSequence {
                tx_id: TransactionId::new(2, 1),
                result: AlreadyPresent,
            }
        );
        assert_eq!(db.contexts().status(request_id), Some(TxStatus::TimedOut));
    }

    #[test]
    fn test_local_ddl_brackets_command() {
        let (db, storage) = single_node();
        db.add_cluster("audit").unwrap();

        assert_eq!(storage.cluster_id("audit"), Some(0));
        assert_eq!(
            storage.executed_commands(),
            vec![("create cluster `audit`".to_string(), RunMode::Replicated)]
        );
        assert_eq!(
            storage.applied_transactions(),
            vec![TransactionId::new(1, 1), TransactionId::new(1, 2)]
        );
        assert_eq!(db.log().last_committed(1), Some(TransactionId::new(1, 2)));
        assert!(db.contexts().is_empty());
        assert_eq!(db.stats_snapshot().ddl_executed, 1);

        db.drop_cluster("audit").unwrap();
        assert_eq!(storage.cluster_id("audit"), None);
    }

    #[test]
    fn test_replicated_mode_executes_directly() {
        let (db, storage) = single_node();
        db.run_ddl("create cluster direct", RunMode::Replicated).unwrap();
        assert_eq!(storage.cluster_id("direct"), Some(0));
        assert!(storage.applied_transactions().is_empty());
    }

    #[test]
    fn test_second_phase_abort_runs_nothing() {
        let (db, storage) = single_node();
        let request_id = RequestId::new(2, 1);
        let payload = db.first_phase_ddl(
            "create cluster x",
            TransactionId::new(2, 1),
            TransactionId::new(2, 2),
            request_id,
        );
        assert!(payload.is_success());
        assert_eq!(db.log().promised_count(2), 2);

        db.second_phase_ddl(request_id, false).unwrap();
        assert!(storage.executed_commands().is_empty());
        assert_eq!(db.log().promised_count(2), 0);
        assert!(db.contexts().is_empty());
    }

    #[test]
    fn test_failed_command_surfaces_error() {
        let (db, storage) = single_node();
        storage.fail_next_commands(2);
        let err = db.add_cluster("audit").unwrap_err();
        assert!(matches!(err, CommitError::Storage(_)));
        assert_eq!(db.stats_snapshot().resyncs, 1);
    }

    #[test]
    fn test_failed_command_releases_after_id() {
        let (db, storage) = single_node();
        storage.fail_next_commands(2);
        db.add_cluster("audit").unwrap_err();

        assert_eq!(db.log().last_committed(1), Some(TransactionId::new(1, 1)));
        assert_eq!(db.log().promised_count(1), 0);
        assert!(db.contexts().is_empty());

        let mut tx = ClientTransaction::new();
        tx.create("person", 9, vec![]);
        let committed = db.commit_transaction(tx).unwrap();
        assert_eq!(committed.tx_id, TransactionId::new(1, 2));
        assert_eq!(db.log().last_committed(1), Some(TransactionId::new(1, 2)));
    }

    #[test]
    fn test_command_body_retried_after_transient_failure() {
        let (db, storage) = single_node();
        storage.fail_next_commands(1);
        db.add_cluster("audit").unwrap();

        assert_eq!(storage.executed_commands().len(), 1);
        assert_eq!(storage.cluster_id("audit"), Some(0));
        assert_eq!(db.log().last_committed(1), Some(TransactionId::new(1, 2)));
        assert_eq!(db.stats_snapshot().resyncs, 0);
        assert_eq!(db.stats_snapshot().ddl_executed, 1);
    }
}
