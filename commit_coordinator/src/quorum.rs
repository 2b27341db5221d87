//! Aggregation of replica responses against a write quorum.
//!
//! One [`QuorumResponseManager`] exists per broadcast round. The messaging
//! layer feeds it responses as they arrive; the coordinator reads the outcome
//! once the round completes or times out. Responses are grouped by outcome
//! and only non-error outcomes count towards the quorum:
//!
//! ```text
//! quorum = 2
//! node-a: Success          group Success        = {node-a, node-c}  -> reached
//! node-b: Exception(...)   (never counted)
//! node-c: Success
//! ```

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CommitError, Result},
    tx_id::{RequestId, TransactionId},
    tx_log::ValidationResult,
};

/// Result a participant sends back for a phase request.
#[derive(Debug, Clone, PartialEq)]
pub enum TxResultPayload {
    Success,
    Exception(CommitError),
    InvalidSequence {
        tx_id: TransactionId,
        result: ValidationResult,
    },
}

/// Non-error outcome a response can be grouped under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseOutcome {
    Success,
    InvalidSequence,
}

impl TxResultPayload {
    pub fn outcome(&self) -> Option<ResponseOutcome> {
        match self {
            TxResultPayload::Success => Some(ResponseOutcome::Success),
            TxResultPayload::InvalidSequence { .. } => Some(ResponseOutcome::InvalidSequence),
            TxResultPayload::Exception(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TxResultPayload::Success)
    }

    fn describe(&self) -> String {
        match self {
            TxResultPayload::Success => "success".to_string(),
            TxResultPayload::Exception(err) => format!("error: {err}"),
            TxResultPayload::InvalidSequence { tx_id, result } => {
                format!("invalid sequence {tx_id} ({result:?})")
            },
        }
    }
}

impl From<Result<()>> for TxResultPayload {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => TxResultPayload::Success,
            Err(CommitError::InvalidSequence { tx_id, result }) => {
                TxResultPayload::InvalidSequence { tx_id, result }
            },
            Err(err) => TxResultPayload::Exception(err),
        }
    }
}

/// Responses collected for one broadcast.
#[derive(Debug)]
pub struct QuorumResponseManager {
    request_id: RequestId,
    targets: BTreeSet<String>,
    expected: usize,
    quorum: usize,
    responses: Mutex<Vec<(String, TxResultPayload)>>,
}

impl QuorumResponseManager {
    pub fn new(
        request_id: RequestId,
        targets: BTreeSet<String>,
        expected: usize,
        quorum: usize,
    ) -> Self {
        Self {
            request_id,
            targets,
            expected,
            quorum,
            responses: Mutex::new(Vec::with_capacity(expected)),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn targets(&self) -> &BTreeSet<String> {
        &self.targets
    }

    /// Record the response of `node`. Returns false for a repeated response
    /// or a node outside the target set.
    pub fn receive(&self, node: &str, payload: TxResultPayload) -> bool {
        if !self.targets.contains(node) {
            tracing::warn!(
                request_id = %self.request_id,
                node,
                "Ignoring response from node outside the target set"
            );
            return false;
        }

        let mut responses = self.responses.lock();
        if responses.iter().any(|(sender, _)| sender == node) {
            tracing::debug!(request_id = %self.request_id, node, "Duplicate response ignored");
            return false;
        }
        responses.push((node.to_string(), payload));
        true
    }

    /// Largest non-error outcome group as `(outcome, size, first index)`.
    /// Equal sizes resolve to the group that answered first.
    fn majority(responses: &[(String, TxResultPayload)]) -> Option<(ResponseOutcome, usize, usize)> {
        let mut groups: Vec<(ResponseOutcome, usize, usize)> = Vec::new();
        for (index, (_, payload)) in responses.iter().enumerate() {
            let Some(outcome) = payload.outcome() else {
                continue;
            };
            match groups.iter_mut().find(|(o, _, _)| *o == outcome) {
                Some(group) => group.1 += 1,
                None => groups.push((outcome, 1, index)),
            }
        }
        groups
            .into_iter()
            .reduce(|best, group| if group.1 > best.1 { group } else { best })
    }

    pub fn is_quorum_reached(&self) -> bool {
        Self::majority(&self.responses.lock()).is_some_and(|(_, size, _)| size >= self.quorum)
    }

    /// Whether every expected response has arrived.
    pub fn is_complete(&self) -> bool {
        self.responses.lock().len() >= self.expected
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }

    /// First response of the majority outcome, once the quorum is reached.
    pub fn final_response(&self) -> Option<TxResultPayload> {
        let responses = self.responses.lock();
        match Self::majority(&responses) {
            Some((_, size, first)) if size >= self.quorum => Some(responses[first].1.clone()),
            _ => None,
        }
    }

    pub fn all_responses(&self) -> Vec<(String, TxResultPayload)> {
        self.responses.lock().clone()
    }

    /// First error any node reported.
    pub fn first_exception(&self) -> Option<CommitError> {
        self.responses
            .lock()
            .iter()
            .find_map(|(_, payload)| match payload {
                TxResultPayload::Exception(err) => Some(err.clone()),
                _ => None,
            })
    }

    /// Targets that have not answered.
    pub fn missing_nodes(&self) -> BTreeSet<String> {
        let responses = self.responses.lock();
        self.targets
            .iter()
            .filter(|t| !responses.iter().any(|(sender, _)| sender == *t))
            .cloned()
            .collect()
    }

    /// One `node: outcome` line per response, then one per missing node.
    pub fn describe(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .responses
            .lock()
            .iter()
            .map(|(node, payload)| format!("{node}: {}", payload.describe()))
            .collect();
        lines.extend(
            self.missing_nodes()
                .into_iter()
                .map(|node| format!("{node}: no response")),
        );
        lines
    }

    /// Resolve the round.
    ///
    /// Without a quorum, the first reported error wins over the generic
    /// [`CommitError::QuorumNotReached`], so callers see the actual conflict.
    pub fn outcome(&self) -> Result<TxResultPayload> {
        if let Some(response) = self.final_response() {
            return Ok(response);
        }
        if let Some(err) = self.first_exception() {
            return Err(err);
        }
        Err(CommitError::QuorumNotReached {
            request: self.request_id,
            quorum: self.quorum,
            responses: self.describe(),
        })
    }
}
