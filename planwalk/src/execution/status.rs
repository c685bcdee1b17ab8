//! Node status machine and failure classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The execution status of a node.
///
/// `Queued -> Running -> {Succeeded, Failed, Aborted, Skipped, Expired}`;
/// `Running` may also move to `Waiting` (blocked on a barrier or remote
/// callback) and back. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created but not yet picked up by a worker.
    Queued,
    /// Actively executing.
    Running,
    /// Blocked on a barrier or a remote callback.
    Waiting,
    /// Completed successfully.
    Succeeded,
    /// Terminated with a classified failure.
    Failed,
    /// Terminated by an interrupt or cancellation.
    Aborted,
    /// Skip condition evaluated true; never executed.
    Skipped,
    /// Timed out before completing.
    Expired,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Skipped => write!(f, "skipped"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl NodeStatus {
    /// Returns true if the status is terminal (absorbing).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Aborted | Self::Skipped | Self::Expired
        )
    }

    /// Returns true for the "broke" set routed through advisers.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Failed | Self::Expired | Self::Aborted)
    }

    /// Returns true if the status allows the branch to continue.
    #[must_use]
    pub fn is_continuable(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Returns true if `next` is a legal transition from this status.
    ///
    /// Transitions are monotonic: once terminal, nothing is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Skipped | Self::Aborted),
            Self::Running => matches!(
                next,
                Self::Waiting | Self::Succeeded | Self::Failed | Self::Aborted | Self::Expired
            ),
            Self::Waiting => matches!(
                next,
                Self::Running | Self::Failed | Self::Aborted | Self::Expired
            ),
            _ => false,
        }
    }
}

/// Classification of why a node terminated unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The work did not complete within its declared timeout.
    Timeout,
    /// The remote worker or target could not be reached.
    Connectivity,
    /// The step itself reported an application-level failure.
    ApplicationError,
    /// Credentials or permissions were rejected.
    Authorization,
    /// Post-execution verification failed.
    Verification,
    /// No remote worker could be provisioned for the task.
    DelegateProvisioning,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connectivity => write!(f, "connectivity"),
            Self::ApplicationError => write!(f, "application_error"),
            Self::Authorization => write!(f, "authorization"),
            Self::Verification => write!(f, "verification"),
            Self::DelegateProvisioning => write!(f, "delegate_provisioning"),
        }
    }
}

/// Structured failure information attached to a terminal node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FailureInfo {
    /// Human-readable failure message.
    pub message: String,
    /// The failure classifications, ordered for stable serialization.
    pub failure_types: BTreeSet<FailureType>,
}

impl FailureInfo {
    /// Creates failure info with a single failure type.
    #[must_use]
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        let mut failure_types = BTreeSet::new();
        failure_types.insert(failure_type);
        Self {
            message: message.into(),
            failure_types,
        }
    }

    /// Creates a synthesized timeout failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message, FailureType::Timeout)
    }

    /// Adds another failure type.
    #[must_use]
    pub fn with_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.insert(failure_type);
        self
    }

    /// Returns true if any of this failure's types appear in `scope`.
    #[must_use]
    pub fn intersects(&self, scope: &BTreeSet<FailureType>) -> bool {
        self.failure_types.iter().any(|t| scope.contains(t))
    }
}
