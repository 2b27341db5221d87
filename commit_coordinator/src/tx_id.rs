// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Identifier types for replicated transactions.
//!
//! # Overview
//!
//! Two identifiers travel with every replicated write:
//!
//! - [`TransactionId`]: `(origin, sequence)`. Issued by the origin node's
//!   [`TransactionLog`](crate::tx_log::TransactionLog), strictly increasing per
//!   origin, and validated by every replica before it takes any lock.
//! - [`RequestId`]: `(node, message)`. Names the broadcast that created a
//!   [`TxContext`](crate::context::TxContext) so that a re-delivered second
//!   phase finds the same context again.
//!
//! Both are small `Copy` values ordered lexicographically by their fields, so
//! `(origin, sequence)` gives the total order transaction ids are compared by.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric cluster member identifier.
pub type NodeId = u32;

/// Transaction identifier scoped by origin node and a per-origin sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    /// Node that issued the id.
    pub origin: NodeId,
    /// Position in the origin's commit order, starting at 1.
    pub sequence: u64,
}

impl TransactionId {
    pub const fn new(origin: NodeId, sequence: u64) -> Self {
        Self { origin, sequence }
    }

    /// The id that must be committed immediately before this one.
    pub fn predecessor(&self) -> Option<Self> {
        self.sequence
            .checked_sub(1)
            .filter(|seq| *seq > 0)
            .map(|sequence| Self::new(self.origin, sequence))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.sequence)
    }
}

/// Identifier of the request that created a transaction context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    /// Node that sent the request.
    pub node: NodeId,
    /// Message counter on the sending node.
    pub message: u64,
}

impl RequestId {
    pub const fn new(node: NodeId, message: u64) -> Self {
        Self { node, message }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.message)
    }
}
