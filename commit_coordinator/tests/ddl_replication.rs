// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for replicated schema commands.

use std::sync::Arc;

use commit_coordinator::{
    ClientTransaction, CommitError, CoordinatorConfig, DistributedDatabase, MemoryCluster,
    MemoryStorage, RemoteTask, RunMode, TaskHandler, TransactionId, TxResultPayload,
    ValidationResult,
};
use parking_lot::Mutex;

struct Node {
    db: Arc<DistributedDatabase>,
    storage: Arc<MemoryStorage>,
}

fn start_cluster(names: &[&str], config: CoordinatorConfig) -> (Arc<MemoryCluster>, Vec<Node>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("commit_coordinator=debug")
        .with_test_writer()
        .try_init();

    let cluster = MemoryCluster::new();
    let nodes = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let storage = Arc::new(MemoryStorage::new());
            let membership = Arc::new(cluster.join(name, i as u32 + 1));
            let db = Arc::new(
                DistributedDatabase::new("db", config.clone(), storage.clone(), membership).unwrap(),
            );
            let handler: Arc<dyn TaskHandler> = db.clone();
            cluster.attach(name, Arc::downgrade(&handler));
            Node { db, storage }
        })
        .collect();
    (cluster, nodes)
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_max_auto_retry(2)
        .with_auto_retry_delay_ms(2)
}

fn commands(node: &Node) -> Vec<String> {
    node.storage
        .executed_commands()
        .into_iter()
        .map(|(query, mode)| {
            assert_eq!(mode, RunMode::Replicated);
            query
        })
        .collect()
}

#[test]
fn test_add_cluster_runs_once_on_every_node() {
    let (_cluster, nodes) = start_cluster(&["node-a", "node-b", "node-c"], test_config());

    nodes[0].db.add_cluster("audit").unwrap();

    for node in &nodes {
        assert_eq!(commands(node), vec!["create cluster `audit`".to_string()]);
        assert_eq!(node.storage.cluster_id("audit"), Some(0));
        assert_eq!(
            node.storage.applied_transactions(),
            vec![TransactionId::new(1, 1), TransactionId::new(1, 2)]
        );
        assert!(node.db.contexts().is_empty());
        assert_eq!(node.db.log().promised_count(1), 0);
    }
}

#[test]
fn test_schema_command_ordered_with_data_writes() {
    let (_cluster, nodes) = start_cluster(&["node-a", "node-b"], test_config());

    let mut tx = ClientTransaction::new();
    tx.create("person", 9, vec![]);
    nodes[0].db.commit_transaction(tx).unwrap();
    nodes[0].db.add_cluster("audit").unwrap();
    let mut tx = ClientTransaction::new();
    tx.create("person", 9, vec![]);
    let committed = nodes[0].db.commit_transaction(tx).unwrap();

    assert_eq!(committed.tx_id, TransactionId::new(1, 4));
    for node in &nodes {
        assert_eq!(
            node.storage.applied_transactions(),
            (1..=4).map(|s| TransactionId::new(1, s)).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_drop_cluster_replicates() {
    let (_cluster, nodes) = start_cluster(&["node-a", "node-b"], test_config());

    nodes[1].db.add_cluster("audit").unwrap();
    nodes[0].db.drop_cluster("audit").unwrap();

    for node in &nodes {
        assert_eq!(node.storage.cluster_id("audit"), None);
        assert_eq!(commands(node).len(), 2);
        assert_eq!(node.db.log().last_committed(1), Some(TransactionId::new(1, 2)));
        assert_eq!(node.db.log().last_committed(2), Some(TransactionId::new(2, 2)));
    }
}

#[test]
fn test_rejecting_minority_resyncs_instead_of_executing() {
    let (cluster, nodes) = start_cluster(&["node-a", "node-b", "node-c"], test_config());
    nodes[1].db.log().commit(TransactionId::new(1, 1)).unwrap();

    nodes[0].db.add_cluster("audit").unwrap();

    assert_eq!(commands(&nodes[0]).len(), 1);
    assert!(commands(&nodes[1]).is_empty());
    assert_eq!(commands(&nodes[2]).len(), 1);
    assert_eq!(nodes[1].db.stats_snapshot().resyncs, 1);
    assert_eq!(
        cluster.resync_requests(),
        vec![("node-b".to_string(), "db".to_string())]
    );
    for node in &nodes {
        assert!(node.db.contexts().is_empty());
    }
}

#[test]
fn test_invalid_sequence_retries_never_execute_body() {
    let (cluster, nodes) = start_cluster(&["node-a", "node-b"], test_config());
    nodes[1].db.log().commit(TransactionId::new(1, 1)).unwrap();

    let err = nodes[0].db.add_cluster("audit").unwrap_err();

    match err {
        CommitError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, CommitError::InvalidSequence { .. }));
        },
        other => panic!("unexpected error: {other}"),
    }
    for node in &nodes {
        assert!(commands(node).is_empty());
        assert!(node.db.contexts().is_empty());
    }
    // 1:1 is committed on node-b, so node-a retires it and asks for a resync.
    assert_eq!(nodes[0].db.log().last_committed(1), None);
    assert_eq!(nodes[0].db.log().next_id(), TransactionId::new(1, 2));
    assert_eq!(
        cluster.resync_requests(),
        vec![("node-a".to_string(), "db".to_string())]
    );
}

/// Answers every schema first phase as if its `before` id were committed.
#[derive(Default)]
struct CommittedPairReplica {
    pairs: Mutex<Vec<(TransactionId, TransactionId)>>,
}

impl TaskHandler for CommittedPairReplica {
    fn handle_task(&self, _sender: &str, task: RemoteTask) -> TxResultPayload {
        match task {
            RemoteTask::DdlFirstPhase { before, after, .. } => {
                self.pairs.lock().push((before, after));
                TxResultPayload::InvalidSequence {
                    tx_id: before,
                    result: ValidationResult::AlreadyPresent,
                }
            },
            _ => TxResultPayload::Success,
        }
    }
}

#[test]
fn test_committed_ids_never_reissued_to_schema_retries() {
    let (cluster, nodes) = start_cluster(&["node-a"], test_config());
    let _membership = cluster.join("node-b", 2);
    let replica = Arc::new(CommittedPairReplica::default());
    let handler: Arc<dyn TaskHandler> = replica.clone();
    cluster.attach("node-b", Arc::downgrade(&handler));

    let err = nodes[0].db.add_cluster("audit").unwrap_err();

    assert!(matches!(err, CommitError::RetriesExhausted { attempts: 3, .. }));
    let pairs = replica.pairs.lock().clone();
    assert_eq!(
        pairs,
        vec![
            (TransactionId::new(1, 1), TransactionId::new(1, 2)),
            (TransactionId::new(1, 2), TransactionId::new(1, 3)),
            (TransactionId::new(1, 3), TransactionId::new(1, 4)),
        ]
    );
    assert!(commands(&nodes[0]).is_empty());
    assert!(nodes[0].db.contexts().is_empty());
    assert_eq!(nodes[0].db.log().promised_count(1), 0);
    assert_eq!(nodes[0].db.stats_snapshot().resyncs, 3);
    assert_eq!(cluster.resync_requests().len(), 3);
}

#[test]
fn test_failing_command_on_replica_forces_resync() {
    let (cluster, nodes) = start_cluster(&["node-a", "node-b"], test_config());
    nodes[1].storage.fail_next_commands(2);

    nodes[0].db.add_cluster("audit").unwrap();

    assert_eq!(commands(&nodes[0]).len(), 1);
    assert!(commands(&nodes[1]).is_empty());
    assert_eq!(
        cluster.resync_requests(),
        vec![("node-b".to_string(), "db".to_string())]
    );
}
