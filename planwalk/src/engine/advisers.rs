//! Adviser chain: rules that inspect a terminal execution outcome and
//! optionally redirect flow.
//!
//! Advisers are pure: they consume the terminal status and failure
//! classification and produce advice. The engine performs the actual jump,
//! retry, or ignore; an adviser never mutates anything itself. Multiple
//! advisers may be attached to a node; the first one whose
//! [`Adviser::can_advise`] returns true wins (first-match, not merge).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::execution::{FailureInfo, FailureType, NodeExecution, NodeStatus};

/// Where a rollback entry point sits relative to the failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Roll back the enclosing stage.
    StageRollback,
    /// Roll back only the enclosing step group.
    StepGroupRollback,
}

/// The terminal outcome an adviser inspects.
#[derive(Debug, Clone, Copy)]
pub struct AdviseEvent<'a> {
    /// The terminal node execution.
    pub node_execution: &'a NodeExecution,
    /// The terminal status (same as the record's, passed for convenience).
    pub status: NodeStatus,
    /// The failure classification, if the node broke.
    pub failure_info: Option<&'a FailureInfo>,
}

/// Advice produced by an adviser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdviserResponse {
    /// Jump to another plan node (rollback entry point).
    NextNode {
        /// The plan node id to execute next.
        node_id: String,
    },
    /// Re-run the failed node after waiting.
    Retry {
        /// How long to wait before the next attempt.
        wait: Duration,
    },
    /// Treat the failure as ignored and continue the branch.
    IgnoreFailure,
    /// Stop walking this branch.
    EndPlan,
}

/// A rule consulted when a node execution reaches a terminal status.
pub trait Adviser: Send + Sync + Debug {
    /// Returns true if this adviser applies to the given outcome.
    fn can_advise(&self, status: NodeStatus, failure_info: Option<&FailureInfo>) -> bool;

    /// Produces advice for the outcome, or `None` to let the branch finish.
    fn on_advise(&self, event: &AdviseEvent<'_>) -> Option<AdviserResponse>;
}

/// Runs the adviser chain: the first adviser whose `can_advise` returns
/// true is asked for advice and its answer is final.
#[must_use]
pub fn advise(advisers: &[Arc<dyn Adviser>], event: &AdviseEvent<'_>) -> Option<AdviserResponse> {
    advisers
        .iter()
        .find(|a| a.can_advise(event.status, event.failure_info))
        .and_then(|a| a.on_advise(event))
}

/// Returns true if `status` is in the broke set and the failure types
/// intersect `scope` (an empty scope applies unconditionally).
///
/// An `Aborted` node only qualifies when it carries failure info: a clean
/// user abort produces no advice.
fn failure_applies(
    status: NodeStatus,
    failure_info: Option<&FailureInfo>,
    scope: &BTreeSet<FailureType>,
) -> bool {
    if !status.is_broken() {
        return false;
    }
    if status == NodeStatus::Aborted && failure_info.is_none() {
        return false;
    }
    if scope.is_empty() {
        return true;
    }
    failure_info.is_some_and(|info| info.intersects(scope))
}

/// The canonical rollback adviser.
///
/// Fires when the node broke and the failure types intersect the
/// configured scope, then resolves its strategy to a rollback node id from
/// the caller-supplied map.
#[derive(Debug, Clone)]
pub struct OnFailRollbackAdviser {
    /// Failure types this adviser is scoped to; empty means unconditional.
    pub applicable_failure_types: BTreeSet<FailureType>,
    /// The configured rollback strategy.
    pub strategy: RollbackStrategy,
    /// Strategy to rollback-entry-point node id.
    pub strategy_to_node: HashMap<RollbackStrategy, String>,
}

impl OnFailRollbackAdviser {
    /// Creates a rollback adviser with an empty (unconditional) scope.
    #[must_use]
    pub fn new(
        strategy: RollbackStrategy,
        strategy_to_node: HashMap<RollbackStrategy, String>,
    ) -> Self {
        Self {
            applicable_failure_types: BTreeSet::new(),
            strategy,
            strategy_to_node,
        }
    }

    /// Scopes the adviser to specific failure types.
    #[must_use]
    pub fn with_failure_types(
        mut self,
        failure_types: impl IntoIterator<Item = FailureType>,
    ) -> Self {
        self.applicable_failure_types = failure_types.into_iter().collect();
        self
    }
}

impl Adviser for OnFailRollbackAdviser {
    fn can_advise(&self, status: NodeStatus, failure_info: Option<&FailureInfo>) -> bool {
        failure_applies(status, failure_info, &self.applicable_failure_types)
    }

    fn on_advise(&self, _event: &AdviseEvent<'_>) -> Option<AdviserResponse> {
        self.strategy_to_node
            .get(&self.strategy)
            .map(|node_id| AdviserResponse::NextNode {
                node_id: node_id.clone(),
            })
    }
}

/// Retries a broken node a bounded number of times with per-attempt waits.
///
/// The wait for attempt `n` is `wait_intervals[n]`, the last interval
/// repeating once the list is exhausted.
#[derive(Debug, Clone)]
pub struct RetryAdviser {
    /// Failure types this adviser is scoped to; empty means unconditional.
    pub applicable_failure_types: BTreeSet<FailureType>,
    /// Maximum number of retry attempts (not counting the first run).
    pub max_attempts: usize,
    /// Waits between attempts.
    pub wait_intervals: Vec<Duration>,
}

impl RetryAdviser {
    /// Creates a retry adviser with an unconditional scope.
    #[must_use]
    pub fn new(max_attempts: usize, wait_intervals: Vec<Duration>) -> Self {
        Self {
            applicable_failure_types: BTreeSet::new(),
            max_attempts,
            wait_intervals,
        }
    }

    /// Scopes the adviser to specific failure types.
    #[must_use]
    pub fn with_failure_types(
        mut self,
        failure_types: impl IntoIterator<Item = FailureType>,
    ) -> Self {
        self.applicable_failure_types = failure_types.into_iter().collect();
        self
    }

    fn wait_for_attempt(&self, attempt: usize) -> Duration {
        self.wait_intervals
            .get(attempt)
            .or_else(|| self.wait_intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Adviser for RetryAdviser {
    fn can_advise(&self, status: NodeStatus, failure_info: Option<&FailureInfo>) -> bool {
        failure_applies(status, failure_info, &self.applicable_failure_types)
    }

    fn on_advise(&self, event: &AdviseEvent<'_>) -> Option<AdviserResponse> {
        let attempt = event.node_execution.attempt_count();
        if attempt >= self.max_attempts {
            return None;
        }
        Some(AdviserResponse::Retry {
            wait: self.wait_for_attempt(attempt),
        })
    }
}

/// Marks a matching failure as ignored so the branch continues.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFailureAdviser {
    /// Failure types this adviser is scoped to; empty means unconditional.
    pub applicable_failure_types: BTreeSet<FailureType>,
}

impl IgnoreFailureAdviser {
    /// Creates an ignore adviser with an unconditional scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes the adviser to specific failure types.
    #[must_use]
    pub fn with_failure_types(
        mut self,
        failure_types: impl IntoIterator<Item = FailureType>,
    ) -> Self {
        self.applicable_failure_types = failure_types.into_iter().collect();
        self
    }
}

impl Adviser for IgnoreFailureAdviser {
    fn can_advise(&self, status: NodeStatus, failure_info: Option<&FailureInfo>) -> bool {
        failure_applies(status, failure_info, &self.applicable_failure_types)
    }

    fn on_advise(&self, _event: &AdviseEvent<'_>) -> Option<AdviserResponse> {
        Some(AdviserResponse::IgnoreFailure)
    }
}
