// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cluster membership and request delivery.
//!
//! The coordinator needs very little from the cluster layer: the set of
//! reachable nodes for a database, a message counter, a way to send a
//! [`RemoteTask`] to a set of nodes and feed their answers into a
//! [`QuorumResponseManager`], and a way to ask for a full resync from a healthy
//! peer. [`ClusterMembership`] is that contract; [`MemoryCluster`] and
//! [`MemoryMembership`] implement it for in-process clusters.
//!
//! Tasks delivered by [`MemoryCluster`] go through a bincode round trip, so
//! anything carried in a task is exercised as it would be on the wire.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CommitError, Result},
    quorum::{QuorumResponseManager, TxResultPayload},
    transaction::ClientTransaction,
    tx_id::{NodeId, RequestId, TransactionId},
};

/// Whether the sender waits for answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Response,
    NoResponse,
}

/// Request sent from a coordinator to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteTask {
    FirstPhase {
        request_id: RequestId,
        tx_id: TransactionId,
        transaction: ClientTransaction,
    },
    SecondPhase {
        request_id: RequestId,
        commit: bool,
    },
    DdlFirstPhase {
        request_id: RequestId,
        query: String,
        before: TransactionId,
        after: TransactionId,
    },
    DdlSecondPhase {
        request_id: RequestId,
        apply: bool,
    },
}

impl RemoteTask {
    pub fn request_id(&self) -> RequestId {
        match self {
            RemoteTask::FirstPhase { request_id, .. }
            | RemoteTask::SecondPhase { request_id, .. }
            | RemoteTask::DdlFirstPhase { request_id, .. }
            | RemoteTask::DdlSecondPhase { request_id, .. } => *request_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteTask::FirstPhase { .. } => "first_phase",
            RemoteTask::SecondPhase { .. } => "second_phase",
            RemoteTask::DdlFirstPhase { .. } => "ddl_first_phase",
            RemoteTask::DdlSecondPhase { .. } => "ddl_second_phase",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Executes tasks received from other nodes.
pub trait TaskHandler: Send + Sync {
    fn handle_task(&self, sender: &str, task: RemoteTask) -> TxResultPayload;
}

/// The membership and messaging layer as seen by the coordinator.
pub trait ClusterMembership: Send + Sync {
    fn local_node_name(&self) -> &str;

    fn local_node_id(&self) -> NodeId;

    /// Names of the reachable nodes serving `db`, the local node included.
    fn available_node_names(&self, db: &str) -> BTreeSet<String>;

    fn available_nodes(&self, db: &str) -> usize {
        self.available_node_names(db).len()
    }

    fn next_message_id(&self) -> u64;

    /// Deliver `task` to `targets`, feeding answers into `responses` when
    /// `mode` is [`ExecutionMode::Response`]. Nodes that do not answer simply
    /// leave no entry in `responses`.
    fn send_request(
        &self,
        db: &str,
        targets: &BTreeSet<String>,
        task: &RemoteTask,
        mode: ExecutionMode,
        responses: &QuorumResponseManager,
    ) -> Result<()>;

    /// Replace the local copy of `db` with a copy from a healthy peer.
    fn request_full_sync(&self, db: &str) -> Result<()>;
}

struct NodeEntry {
    id: NodeId,
    handler: Option<Weak<dyn TaskHandler>>,
}

/// Shared in-process transport connecting several nodes.
pub struct MemoryCluster {
    nodes: RwLock<BTreeMap<String, NodeEntry>>,
    /// Nodes that neither send nor receive.
    partitioned: RwLock<BTreeSet<String>>,
    messages_sent: AtomicU64,
    dropped_messages: AtomicU64,
    resync_requests: Mutex<Vec<(String, String)>>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("nodes", &self.nodes.read().keys().collect::<Vec<_>>())
            .field("partitioned", &*self.partitioned.read())
            .field("messages_sent", &self.messages_sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            partitioned: RwLock::new(BTreeSet::new()),
            messages_sent: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            resync_requests: Mutex::new(Vec::new()),
        })
    }

    /// Add a node and return its view of the cluster.
    pub fn join(self: &Arc<Self>, name: &str, id: NodeId) -> MemoryMembership {
        self.nodes
            .write()
            .insert(name.to_string(), NodeEntry { id, handler: None });
        MemoryMembership {
            cluster: Arc::clone(self),
            name: name.to_string(),
            id,
            message_counter: AtomicU64::new(0),
        }
    }

    /// Route tasks addressed to `name` to `handler`.
    pub fn attach(&self, name: &str, handler: Weak<dyn TaskHandler>) {
        if let Some(entry) = self.nodes.write().get_mut(name) {
            entry.handler = Some(handler);
        }
    }

    pub fn partition(&self, name: &str) {
        self.partitioned.write().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.partitioned.write().remove(name);
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.nodes.read().contains_key(name) && !self.partitioned.read().contains(name)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.read().get(name).map(|e| e.id)
    }

    fn online_nodes(&self) -> BTreeSet<String> {
        let partitioned = self.partitioned.read();
        self.nodes
            .read()
            .keys()
            .filter(|name| !partitioned.contains(*name))
            .cloned()
            .collect()
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.nodes
            .read()
            .get(name)
            .and_then(|e| e.handler.as_ref())
            .and_then(Weak::upgrade)
    }

    fn deliver(&self, sender: &str, target: &str, bytes: &[u8]) -> Result<Option<TxResultPayload>> {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if !self.is_online(sender) || !self.is_online(target) {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        let Some(handler) = self.handler(target) else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let task = RemoteTask::from_bytes(bytes)?;
        Ok(Some(handler.handle_task(sender, task)))
    }

    /// Total tasks handed to the transport, delivered or not.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// `(node, database)` pairs that asked for a full resync.
    pub fn resync_requests(&self) -> Vec<(String, String)> {
        self.resync_requests.lock().clone()
    }
}

/// One node's handle on a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemoryMembership {
    cluster: Arc<MemoryCluster>,
    name: String,
    id: NodeId,
    message_counter: AtomicU64,
}

impl MemoryMembership {
    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }
}

impl ClusterMembership for MemoryMembership {
    fn local_node_name(&self) -> &str {
        &self.name
    }

    fn local_node_id(&self) -> NodeId {
        self.id
    }

    fn available_node_names(&self, _db: &str) -> BTreeSet<String> {
        if !self.cluster.is_online(&self.name) {
            return BTreeSet::from([self.name.clone()]);
        }
        self.cluster.online_nodes()
    }

    fn next_message_id(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn send_request(
        &self,
        db: &str,
        targets: &BTreeSet<String>,
        task: &RemoteTask,
        mode: ExecutionMode,
        responses: &QuorumResponseManager,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let bytes = task.to_bytes()?;
        tracing::debug!(
            db,
            sender = %self.name,
            task = task.name(),
            request_id = %task.request_id(),
            targets = targets.len(),
            "Sending request"
        );

        for target in targets.iter().filter(|t| **t != self.name) {
            let Some(payload) = self.cluster.deliver(&self.name, target, &bytes)? else {
                tracing::debug!(target = %target, task = task.name(), "No response");
                continue;
            };
            if mode == ExecutionMode::Response {
                responses.receive(target, payload);
            }
        }
        Ok(())
    }

    fn request_full_sync(&self, db: &str) -> Result<()> {
        if self.cluster.online_nodes().len() < 2 || !self.cluster.is_online(&self.name) {
            return Err(CommitError::NodeOffline(format!(
                "no healthy peer to resync '{db}' from"
            )));
        }
        tracing::warn!(node = %self.name, db, "Requesting full database resync");
        self.cluster
            .resync_requests
            .lock()
            .push((self.name.clone(), db.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        received: Mutex<Vec<(String, RequestId)>>,
    }

    impl TaskHandler for Echo {
        fn handle_task(&self, sender: &str, task: RemoteTask) -> TxResultPayload {
            self.received
                .lock()
                .push((sender.to_string(), task.request_id()));
            TxResultPayload::Success
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            received: Mutex::new(Vec::new()),
        })
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_send_request_collects_responses() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("a", 1);
        let _b = cluster.join("b", 2);
        let _c = cluster.join("c", 3);
        let hb = echo();
        let hc = echo();
        cluster.attach("b", Arc::downgrade(&(hb.clone() as Arc<dyn TaskHandler>)));
        cluster.attach("c", Arc::downgrade(&(hc.clone() as Arc<dyn TaskHandler>)));

        let request_id = RequestId::new(1, a.next_message_id());
        let task = RemoteTask::SecondPhase {
            request_id,
            commit: true,
        };
        let qm = QuorumResponseManager::new(request_id, names(&["b", "c"]), 2, 2);
        a.send_request("db", &names(&["a", "b", "c"]), &task, ExecutionMode::Response, &qm)
            .unwrap();

        assert!(qm.is_quorum_reached());
        assert_eq!(cluster.messages_sent(), 2);
        assert_eq!(hb.received.lock()[0], ("a".to_string(), request_id));
    }

    #[test]
    fn test_partitioned_node_does_not_answer() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("a", 1);
        let _b = cluster.join("b", 2);
        let hb = echo();
        cluster.attach("b", Arc::downgrade(&(hb.clone() as Arc<dyn TaskHandler>)));
        cluster.partition("b");

        assert_eq!(a.available_node_names("db"), names(&["a"]));
        assert_eq!(a.available_nodes("db"), 1);

        let request_id = RequestId::new(1, 1);
        let qm = QuorumResponseManager::new(request_id, names(&["b"]), 1, 1);
        let task = RemoteTask::DdlSecondPhase {
            request_id,
            apply: false,
        };
        a.send_request("db", &names(&["b"]), &task, ExecutionMode::Response, &qm)
            .unwrap();
        assert_eq!(qm.response_count(), 0);
        assert_eq!(cluster.dropped_messages(), 1);

        cluster.heal("b");
        assert_eq!(a.available_nodes("db"), 2);
    }

    #[test]
    fn test_dropped_handler_counts_as_silence() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("a", 1);
        let _b = cluster.join("b", 2);
        {
            let hb = echo();
            cluster.attach("b", Arc::downgrade(&(hb as Arc<dyn TaskHandler>)));
        }
        let request_id = RequestId::new(1, 1);
        let qm = QuorumResponseManager::new(request_id, names(&["b"]), 1, 1);
        let task = RemoteTask::SecondPhase {
            request_id,
            commit: false,
        };
        a.send_request("db", &names(&["b"]), &task, ExecutionMode::Response, &qm)
            .unwrap();
        assert_eq!(qm.response_count(), 0);
    }

    #[test]
    fn test_message_ids_increase() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("a", 1);
        assert_eq!(a.next_message_id(), 1);
        assert_eq!(a.next_message_id(), 2);
        assert_eq!(a.local_node_id(), 1);
        assert_eq!(a.local_node_name(), "a");
    }

    #[test]
    fn test_task_wire_round_trip() {
        let mut transaction = ClientTransaction::new();
        transaction.create("person", 9, b"doc".to_vec());
        let task = RemoteTask::FirstPhase {
            request_id: RequestId::new(1, 3),
            tx_id: TransactionId::new(1, 4),
            transaction,
        };
        let decoded = RemoteTask::from_bytes(&task.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_full_sync_needs_a_peer() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("a", 1);
        assert!(matches!(
            a.request_full_sync("db"),
            Err(CommitError::NodeOffline(_))
        ));

        let _b = cluster.join("b", 2);
        a.request_full_sync("db").unwrap();
        assert_eq!(
            cluster.resync_requests(),
            vec![("a".to_string(), "db".to_string())]
        );
    }
}
