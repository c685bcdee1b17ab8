//! The mutable runtime record of one plan node's execution attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FailureInfo, NodeStatus};

/// One entry in a node execution's append-only response log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableResponse {
    /// When the response was recorded.
    pub ts: DateTime<Utc>,
    /// The opaque response payload.
    pub payload: serde_json::Value,
}

impl ExecutableResponse {
    /// Creates a response entry stamped with the current time.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            ts: Utc::now(),
            payload,
        }
    }
}

/// The kind of interrupt applied to a node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// The run was aborted.
    Abort,
    /// The node's timeout elapsed.
    Expire,
    /// A retry of the node was requested.
    Retry,
}

/// One entry in a node execution's interrupt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRecord {
    /// The interrupt kind.
    pub kind: InterruptKind,
    /// When the interrupt was registered.
    pub ts: DateTime<Utc>,
    /// Why the interrupt was issued.
    pub reason: String,
}

impl InterruptRecord {
    /// Creates an interrupt record stamped with the current time.
    #[must_use]
    pub fn new(kind: InterruptKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            ts: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// The mutable runtime instance of one plan node within one pipeline run.
///
/// Status transitions are monotonic through the state machine; once a
/// terminal status is reached the record is never mutated again. A retry
/// creates a *new* record linked through [`retry_ids`](Self::retry_ids),
/// preserving the full attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique id of this execution attempt.
    pub id: Uuid,
    /// The pipeline run this execution belongs to.
    pub run_id: Uuid,
    /// The plan node this execution instantiates.
    pub plan_node_id: String,
    /// Current status.
    pub status: NodeStatus,
    /// When the node entered `Running`.
    pub start_ts: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub end_ts: Option<DateTime<Utc>>,
    /// Failure classification, set when the node terminates unsuccessfully.
    pub failure_info: Option<FailureInfo>,
    /// Append-only log of responses produced while executing.
    pub executable_responses: Vec<ExecutableResponse>,
    /// Ids of prior attempts, most recent first.
    pub retry_ids: Vec<Uuid>,
    /// Interrupts applied to this execution.
    pub interrupt_history: Vec<InterruptRecord>,
}

impl NodeExecution {
    /// Creates a fresh `Queued` execution for a plan node.
    #[must_use]
    pub fn new(run_id: Uuid, plan_node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            plan_node_id: plan_node_id.into(),
            status: NodeStatus::Queued,
            start_ts: None,
            end_ts: None,
            failure_info: None,
            executable_responses: Vec::new(),
            retry_ids: Vec::new(),
            interrupt_history: Vec::new(),
        }
    }

    /// Creates a new attempt linked to a prior one.
    ///
    /// The previous record is left untouched; its id and its own retry
    /// chain are prepended to the new record's chain.
    #[must_use]
    pub fn retry_of(previous: &Self) -> Self {
        let mut next = Self::new(previous.run_id, previous.plan_node_id.clone());
        next.retry_ids.push(previous.id);
        next.retry_ids.extend(previous.retry_ids.iter().copied());
        next
    }

    /// Number of attempts before this one.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.retry_ids.len()
    }

    /// Returns the most recent executable response, if any.
    #[must_use]
    pub fn latest_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_execution_is_queued() {
        let exec = NodeExecution::new(Uuid::new_v4(), "deploy");
        assert_eq!(exec.status, NodeStatus::Queued);
        assert!(exec.start_ts.is_none());
        assert!(exec.retry_ids.is_empty());
    }

    #[test]
    fn test_retry_links_previous_attempts() {
        let run_id = Uuid::new_v4();
        let first = NodeExecution::new(run_id, "deploy");
        let second = NodeExecution::retry_of(&first);
        let third = NodeExecution::retry_of(&second);

        assert_eq!(second.retry_ids, vec![first.id]);
        assert_eq!(third.retry_ids, vec![second.id, first.id]);
        assert_eq!(third.attempt_count(), 2);
        assert_eq!(third.run_id, run_id);
        assert_eq!(third.plan_node_id, "deploy");
        // the prior record is untouched
        assert_eq!(first.status, NodeStatus::Queued);
    }

    #[test]
    fn test_responses_are_appended_in_order() {
        let mut exec = NodeExecution::new(Uuid::new_v4(), "deploy");
        exec.executable_responses
            .push(ExecutableResponse::new(serde_json::json!({"step": 1})));
        exec.executable_responses
            .push(ExecutableResponse::new(serde_json::json!({"step": 2})));

        let latest = exec.latest_response().unwrap();
        assert_eq!(latest.payload, serde_json::json!({"step": 2}));
    }
}
