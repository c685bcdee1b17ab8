//! Immutable plan graphs.
//!
//! A [`Plan`] is produced once per pipeline run and never mutated
//! afterward, so it is safe for unsynchronized concurrent reads across
//! workers. The mutable runtime counterpart of a [`PlanNode`] is
//! [`NodeExecution`](crate::execution::NodeExecution).

mod builder;

pub use builder::{PlanBuilder, PlanNodeBuilder};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::Adviser;

/// Execution mode of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilitatorMode {
    /// Invoke the step executor in-process and apply its response.
    Sync,
    /// Dispatch to a remote worker and resume via callback.
    Async,
    /// Spawn child branches concurrently; reduce their outcomes.
    Child,
    /// Run child branches strictly in sequence; reduce their outcomes.
    ChildChain,
}

impl fmt::Display for FacilitatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
            Self::Child => write!(f, "child"),
            Self::ChildChain => write!(f, "child_chain"),
        }
    }
}

/// Condition deciding whether a node is skipped instead of executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkipCondition {
    /// Never skip.
    #[default]
    Never,
    /// Always skip.
    Always,
    /// Skip when the run context has `key` equal to `value`.
    ContextEquals {
        /// The context key to inspect.
        key: String,
        /// The value that triggers the skip.
        value: serde_json::Value,
    },
}

impl SkipCondition {
    /// Evaluates the condition against the run context.
    #[must_use]
    pub fn evaluate(&self, run_context: &serde_json::Value) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::ContextEquals { key, value } => {
                run_context.get(key).is_some_and(|v| v == value)
            }
        }
    }
}

/// Static definition of one step in a plan.
///
/// Created at plan-creation time and immutable afterward.
#[derive(Debug, Clone)]
pub struct PlanNode {
    /// Unique id within the plan.
    pub id: String,
    /// Human-readable identifier (defaults to the id).
    pub identifier: String,
    /// The step type resolved against the step registry at run time.
    pub step_type: String,
    /// How the step is facilitated.
    pub facilitator_mode: FacilitatorMode,
    /// Opaque payload interpreted by the step executor.
    pub step_parameters: serde_json::Value,
    /// Evaluated before execution; true skips the node.
    pub skip_condition: SkipCondition,
    /// Per-node execution timeout.
    pub timeout: Option<Duration>,
    /// The next node in this branch, if any.
    pub next_id: Option<String>,
    /// Child branch entry points (Child / ChildChain facilitation).
    pub child_ids: Vec<String>,
    /// Barrier this node arrives at after completing its own work.
    pub barrier_identifier: Option<String>,
    /// Advisers consulted when this node reaches a terminal status.
    pub advisers: Vec<Arc<dyn Adviser>>,
}

impl PlanNode {
    /// Starts building a plan node.
    #[must_use]
    pub fn builder(id: impl Into<String>, step_type: impl Into<String>) -> PlanNodeBuilder {
        PlanNodeBuilder::new(id, step_type)
    }
}

/// An immutable, acyclic graph of plan nodes for one pipeline run.
#[derive(Debug, Clone)]
pub struct Plan {
    id: Uuid,
    nodes: HashMap<String, Arc<PlanNode>>,
    start_id: String,
}

impl Plan {
    pub(crate) fn new(nodes: HashMap<String, Arc<PlanNode>>, start_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes,
            start_id,
        }
    }

    /// Returns the plan id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the id of the node the walk starts from.
    #[must_use]
    pub fn start_id(&self) -> &str {
        &self.start_id
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Arc<PlanNode>> {
        self.nodes.get(id)
    }

    /// Returns the number of nodes in the plan.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Counts the nodes expected to arrive at a barrier identifier.
    #[must_use]
    pub fn barrier_participants(&self, identifier: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.barrier_identifier.as_deref() == Some(identifier))
            .count()
    }
}
