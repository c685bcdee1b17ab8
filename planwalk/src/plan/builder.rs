//! Builders and structural validation for plan graphs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Adviser;
use crate::errors::PlanValidationError;

use super::{FacilitatorMode, Plan, PlanNode, SkipCondition};

/// Builder for a single plan node.
#[derive(Debug)]
pub struct PlanNodeBuilder {
    id: String,
    identifier: Option<String>,
    step_type: String,
    facilitator_mode: FacilitatorMode,
    step_parameters: serde_json::Value,
    skip_condition: SkipCondition,
    timeout: Option<Duration>,
    next_id: Option<String>,
    child_ids: Vec<String>,
    barrier_identifier: Option<String>,
    advisers: Vec<Arc<dyn Adviser>>,
}

impl PlanNodeBuilder {
    /// Creates a builder for a sync node with empty parameters.
    #[must_use]
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identifier: None,
            step_type: step_type.into(),
            facilitator_mode: FacilitatorMode::Sync,
            step_parameters: serde_json::Value::Null,
            skip_condition: SkipCondition::Never,
            timeout: None,
            next_id: None,
            child_ids: Vec::new(),
            barrier_identifier: None,
            advisers: Vec::new(),
        }
    }

    /// Sets the human-readable identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Sets the facilitation mode.
    #[must_use]
    pub fn with_mode(mut self, mode: FacilitatorMode) -> Self {
        self.facilitator_mode = mode;
        self
    }

    /// Sets the opaque step parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    /// Sets the skip condition.
    #[must_use]
    pub fn with_skip_condition(mut self, condition: SkipCondition) -> Self {
        self.skip_condition = condition;
        self
    }

    /// Sets the per-node execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Links the next node in this branch.
    #[must_use]
    pub fn then(mut self, next_id: impl Into<String>) -> Self {
        self.next_id = Some(next_id.into());
        self
    }

    /// Adds a child branch entry point.
    #[must_use]
    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.child_ids.push(child_id.into());
        self
    }

    /// Marks this node as arriving at a barrier after its own work.
    #[must_use]
    pub fn with_barrier(mut self, identifier: impl Into<String>) -> Self {
        self.barrier_identifier = Some(identifier.into());
        self
    }

    /// Attaches an adviser; chain order is consultation order.
    #[must_use]
    pub fn with_adviser(mut self, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.push(adviser);
        self
    }

    /// Builds the immutable node.
    #[must_use]
    pub fn build(self) -> PlanNode {
        let identifier = self.identifier.unwrap_or_else(|| self.id.clone());
        PlanNode {
            id: self.id,
            identifier,
            step_type: self.step_type,
            facilitator_mode: self.facilitator_mode,
            step_parameters: self.step_parameters,
            skip_condition: self.skip_condition,
            timeout: self.timeout,
            next_id: self.next_id,
            child_ids: self.child_ids,
            barrier_identifier: self.barrier_identifier,
            advisers: self.advisers,
        }
    }
}

/// Builder for a validated plan graph.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    nodes: Vec<PlanNode>,
    start_id: Option<String>,
}

impl PlanBuilder {
    /// Creates an empty plan builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the plan.
    #[must_use]
    pub fn node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Sets the node the walk starts from.
    #[must_use]
    pub fn start_at(mut self, id: impl Into<String>) -> Self {
        self.start_id = Some(id.into());
        self
    }

    /// Validates the graph and builds the immutable plan.
    ///
    /// Checks: at least one node, a resolvable start node, unique ids, no
    /// dangling `next`/`child` references, and no cycles over the combined
    /// next/child edges.
    pub fn build(self) -> Result<Plan, PlanValidationError> {
        if self.nodes.is_empty() {
            return Err(PlanValidationError::Empty);
        }

        let mut nodes: HashMap<String, Arc<PlanNode>> = HashMap::new();
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(PlanValidationError::DuplicateNode { id: node.id });
            }
            nodes.insert(node.id.clone(), Arc::new(node));
        }

        let start_id = self.start_id.ok_or(PlanValidationError::Empty)?;
        if !nodes.contains_key(&start_id) {
            return Err(PlanValidationError::DanglingReference {
                id: "<start>".into(),
                reference: start_id,
            });
        }

        for node in nodes.values() {
            for reference in node.next_id.iter().chain(node.child_ids.iter()) {
                if !nodes.contains_key(reference) {
                    return Err(PlanValidationError::DanglingReference {
                        id: node.id.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        detect_cycle(&nodes)?;

        Ok(Plan::new(nodes, start_id))
    }
}

/// Depth-first cycle detection over next + child edges.
fn detect_cycle(nodes: &HashMap<String, Arc<PlanNode>>) -> Result<(), PlanValidationError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_stack: HashSet<&str> = HashSet::new();
    let mut stack_path: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        nodes: &'a HashMap<String, Arc<PlanNode>>,
        visited: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
        stack_path: &mut Vec<&'a str>,
    ) -> Result<(), PlanValidationError> {
        if in_stack.contains(id) {
            let mut path: Vec<String> = stack_path
                .iter()
                .skip_while(|n| **n != id)
                .map(|n| (*n).to_string())
                .collect();
            path.push(id.to_string());
            return Err(PlanValidationError::Cycle { path });
        }
        if visited.contains(id) {
            return Ok(());
        }
        visited.insert(id);
        in_stack.insert(id);
        stack_path.push(id);

        if let Some(node) = nodes.get(id) {
            for next in node.next_id.iter().chain(node.child_ids.iter()) {
                visit(next, nodes, visited, in_stack, stack_path)?;
            }
        }

        in_stack.remove(id);
        stack_path.pop();
        Ok(())
    }

    for id in nodes.keys() {
        visit(id, nodes, &mut visited, &mut in_stack, &mut stack_path)?;
    }
    Ok(())
}
