//! Error types for the planwalk execution kernel.
//!
//! The taxonomy distinguishes transient infrastructure errors (retried with
//! backoff at the call site), protocol violations (logged, never silently
//! ignored), and fatal engine errors (abort the run, never retried).
//! Execution-domain failures are not errors at all: they travel as
//! [`FailureInfo`](crate::execution::FailureInfo) on the node's status and
//! are routed through the adviser chain.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::execution::NodeStatus;

/// The main error type for planwalk operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The persistence store is unavailable or misbehaving.
    #[error("store error: {0}")]
    Store(String),

    /// The remote task channel is unavailable.
    #[error("remote task channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// A conditional status update was rejected because the stored status
    /// no longer matches the precondition.
    #[error("transition rejected for node execution {node_execution_id}: expected {expected}, found {actual}")]
    TransitionRejected {
        /// The node execution whose update was rejected.
        node_execution_id: Uuid,
        /// The status the caller expected to find.
        expected: NodeStatus,
        /// The status actually stored.
        actual: NodeStatus,
    },

    /// A transition that the state machine does not permit.
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        /// The current status.
        from: NodeStatus,
        /// The requested status.
        to: NodeStatus,
    },

    /// A barrier id did not resolve to a known instance.
    #[error("barrier instance {0} not found")]
    BarrierNotFound(Uuid),

    /// The idempotent lock could not be acquired within the timeout.
    ///
    /// Raised as a distinct variant so callers can decide whether to abort
    /// or degrade when another party holds the operation.
    #[error("could not acquire idempotent lock for '{id}' within {timeout:?}")]
    IdempotentLockTimeout {
        /// The contested operation id.
        id: String,
        /// The total acquisition timeout that elapsed.
        timeout: Duration,
    },

    /// No step executor is registered for the plan node's step type.
    #[error("unknown step type: {step_type}")]
    UnknownStepType {
        /// The unresolvable step type.
        step_type: String,
    },

    /// The plan graph references nodes that do not exist or is otherwise
    /// unusable at execution time.
    #[error("corrupt plan: {reason}")]
    CorruptPlan {
        /// Why the plan is unusable.
        reason: String,
    },

    /// A step was invoked through an entry point it does not implement.
    #[error("step type '{step_type}' does not support {capability} execution")]
    CapabilityViolation {
        /// The offending step type.
        step_type: String,
        /// The missing capability.
        capability: &'static str,
    },

    /// Plan validation failed at build time.
    #[error("{0}")]
    PlanValidation(#[from] PlanValidationError),

    /// A node execution id did not resolve to a stored record.
    #[error("node execution {0} not found")]
    NodeExecutionNotFound(Uuid),
}

impl EngineError {
    /// Returns true for transient infrastructure errors that call sites
    /// should retry with bounded backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::ChannelUnavailable(_))
    }

    /// Returns true for fatal engine errors that abort the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownStepType { .. } | Self::CorruptPlan { .. })
    }
}

/// Error raised when a plan fails structural validation.
#[derive(Debug, Clone, Error)]
pub enum PlanValidationError {
    /// The graph contains a dependency cycle.
    #[error("plan contains a cycle: {}", path.join(" -> "))]
    Cycle {
        /// The node ids forming the cycle.
        path: Vec<String>,
    },

    /// Two nodes share the same id.
    #[error("duplicate plan node id: '{id}'")]
    DuplicateNode {
        /// The duplicated id.
        id: String,
    },

    /// A node references an id that is not in the plan.
    #[error("node '{id}' references unknown node '{reference}'")]
    DanglingReference {
        /// The referencing node.
        id: String,
        /// The missing target.
        reference: String,
    },

    /// The plan has no nodes or no start node.
    #[error("plan has no start node")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Store("down".into()).is_transient());
        assert!(EngineError::ChannelUnavailable("down".into()).is_transient());
        assert!(!EngineError::UnknownStepType { step_type: "x".into() }.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::UnknownStepType { step_type: "x".into() }.is_fatal());
        assert!(EngineError::CorruptPlan { reason: "loop".into() }.is_fatal());
        assert!(!EngineError::Store("down".into()).is_fatal());
    }

    #[test]
    fn test_idempotent_lock_timeout_message() {
        let err = EngineError::IdempotentLockTimeout {
            id: "idem:abc".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("idem:abc"));
    }

    #[test]
    fn test_cycle_message_joins_path() {
        let err = PlanValidationError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(err.to_string().contains("a -> b -> a"));
    }
}
