//! Commit coordinator for a replicated document database.
//!
//! Every write transaction is committed on a quorum of replicas with a
//! two-phase protocol. Transaction ids are sequenced per origin node, so all
//! replicas apply the writes of one origin in the same order; schema commands
//! take a pair of ids and run at a fixed point of that order.
//!
//! # Architecture
//!
//! ```text
//! DistributedDatabase
//!   ├── TransactionLog (per-origin id sequencing and validation)
//!   ├── LockManager (blocking record and index-key locks)
//!   ├── ContextRegistry (pending TxContexts by request id)
//!   ├── QuorumResponseManager (per-broadcast response aggregation)
//!   ├── RetryController (bounded retries with random delay)
//!   ├── LocalStorage (record ids, MVCC versions, schema commands)
//!   └── ClusterMembership (available nodes, task delivery, resync)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use commit_coordinator::{ClientTransaction, DistributedDatabase, MemoryCluster, MemoryStorage};
//!
//! let cluster = MemoryCluster::new();
//! let db = Arc::new(DistributedDatabase::new(
//!     "db",
//!     CoordinatorConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(cluster.join("node-a", 1)),
//! )?);
//! cluster.attach("node-a", Arc::downgrade(&db));
//!
//! let mut tx = ClientTransaction::new();
//! tx.create("person", 9, b"alice".to_vec());
//! let committed = db.commit_transaction(tx)?;
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod atomic_io;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod ddl;
pub mod error;
pub mod lock_manager;
pub mod membership;
pub mod metrics;
pub mod quorum;
pub mod retry;
pub mod storage;
pub mod transaction;
pub mod tx_id;
pub mod tx_log;

// Re-exports
pub use atomic_io::{atomic_write, read_if_exists, AtomicIoError};
pub use config::{ClusterReplication, CoordinatorConfig, ReplicationConfig, WriteQuorum};
pub use context::{ContextPayload, ContextRegistry, TxContext, TxStatus};
pub use coordinator::{check_unique_keys, check_versions, CommittedTransaction, DistributedDatabase};
pub use ddl::{ddl_sequence_conflict, decide_ddl, DdlDecision};
pub use error::{CommitError, Result};
pub use lock_manager::{lock_keys_for, order_lock_keys, LockKey, LockManager};
pub use membership::{
    ClusterMembership, ExecutionMode, MemoryCluster, MemoryMembership, RemoteTask, TaskHandler,
};
pub use metrics::{CoordinatorStats, CoordinatorStatsSnapshot, TimingSnapshot, TimingStats};
pub use quorum::{QuorumResponseManager, ResponseOutcome, TxResultPayload};
pub use retry::RetryController;
pub use storage::{
    IndexManager, IndexType, LocalStorage, MemoryStorage, RecordMetadata, RunMode, StoredRecord,
};
pub use transaction::{
    ClientTransaction, IndexChanges, IndexEntry, IndexOperation, OperationKind, RecordId,
    RecordOperation,
};
pub use tx_id::{NodeId, RequestId, TransactionId};
pub use tx_log::{LogSnapshot, TransactionLog, TxMetadata, ValidationResult};
