//! Persistence boundary for node executions.
//!
//! Every status change goes through [`NodeExecutionStore::update_status`],
//! a conditional update keyed on the current status. A transition whose
//! precondition no longer holds is rejected, never silently overwritten,
//! so concurrent workers cannot reorder a single execution's transitions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::EngineError;

use super::{ExecutableResponse, FailureInfo, InterruptRecord, NodeExecution, NodeStatus};

/// Storage boundary for [`NodeExecution`] records.
#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Inserts a new execution record.
    async fn insert(&self, exec: NodeExecution) -> Result<(), EngineError>;

    /// Fetches an execution by id.
    async fn get(&self, id: Uuid) -> Result<Option<NodeExecution>, EngineError>;

    /// Applies a status transition conditionally.
    ///
    /// The update succeeds only if the stored status equals `expected` and
    /// `expected -> new` is a legal machine transition. `start_ts` is set on
    /// the first move to `Running`, `end_ts` when `new` is terminal.
    async fn update_status(
        &self,
        id: Uuid,
        expected: NodeStatus,
        new: NodeStatus,
    ) -> Result<NodeExecution, EngineError>;

    /// Appends an executable response to the record's log.
    async fn record_response(
        &self,
        id: Uuid,
        response: ExecutableResponse,
    ) -> Result<(), EngineError>;

    /// Sets failure info on a not-yet-terminal record.
    async fn set_failure(&self, id: Uuid, failure: FailureInfo) -> Result<(), EngineError>;

    /// Appends an interrupt record.
    async fn record_interrupt(
        &self,
        id: Uuid,
        interrupt: InterruptRecord,
    ) -> Result<(), EngineError>;

    /// Lists all executions belonging to a run.
    async fn by_run(&self, run_id: Uuid) -> Result<Vec<NodeExecution>, EngineError>;
}

/// In-memory node execution store.
///
/// Single-document conditional updates are modeled by holding the map lock
/// across the read-check-write, matching the find-and-modify discipline a
/// durable store would provide.
#[derive(Debug, Default)]
pub struct InMemoryNodeExecutionStore {
    records: Mutex<HashMap<Uuid, NodeExecution>>,
}

impl InMemoryNodeExecutionStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl NodeExecutionStore for InMemoryNodeExecutionStore {
    async fn insert(&self, exec: NodeExecution) -> Result<(), EngineError> {
        self.records.lock().insert(exec.id, exec);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NodeExecution>, EngineError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: NodeStatus,
        new: NodeStatus,
    ) -> Result<NodeExecution, EngineError> {
        if !expected.can_transition_to(new) {
            return Err(EngineError::IllegalTransition { from: expected, to: new });
        }

        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .ok_or(EngineError::NodeExecutionNotFound(id))?;

        if record.status != expected {
            return Err(EngineError::TransitionRejected {
                node_execution_id: id,
                expected,
                actual: record.status,
            });
        }

        record.status = new;
        if new == NodeStatus::Running && record.start_ts.is_none() {
            record.start_ts = Some(chrono::Utc::now());
        }
        if new.is_terminal() {
            record.end_ts = Some(chrono::Utc::now());
        }

        Ok(record.clone())
    }

    async fn record_response(
        &self,
        id: Uuid,
        response: ExecutableResponse,
    ) -> Result<(), EngineError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .ok_or(EngineError::NodeExecutionNotFound(id))?;
        record.executable_responses.push(response);
        Ok(())
    }

    async fn set_failure(&self, id: Uuid, failure: FailureInfo) -> Result<(), EngineError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .ok_or(EngineError::NodeExecutionNotFound(id))?;
        record.failure_info = Some(failure);
        Ok(())
    }

    async fn record_interrupt(
        &self,
        id: Uuid,
        interrupt: InterruptRecord,
    ) -> Result<(), EngineError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .ok_or(EngineError::NodeExecutionNotFound(id))?;
        record.interrupt_history.push(interrupt);
        Ok(())
    }

    async fn by_run(&self, run_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        let records = self.records.lock();
        let mut found: Vec<NodeExecution> = records
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.start_ts);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_execution() -> NodeExecution {
        NodeExecution::new(Uuid::new_v4(), "deploy")
    }

    #[tokio::test]
    async fn test_conditional_update_applies() {
        let store = InMemoryNodeExecutionStore::new();
        let exec = queued_execution();
        let id = exec.id;
        store.insert(exec).await.unwrap();

        let updated = store
            .update_status(id, NodeStatus::Queued, NodeStatus::Running)
            .await
            .unwrap();
        assert_eq!(updated.status, NodeStatus::Running);
        assert!(updated.start_ts.is_some());
    }

    #[tokio::test]
    async fn test_stale_precondition_is_rejected() {
        let store = InMemoryNodeExecutionStore::new();
        let exec = queued_execution();
        let id = exec.id;
        store.insert(exec).await.unwrap();

        store
            .update_status(id, NodeStatus::Queued, NodeStatus::Running)
            .await
            .unwrap();

        // A second worker still believing the node is Queued loses the race.
        let err = store
            .update_status(id, NodeStatus::Queued, NodeStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransitionRejected { .. }));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_refused() {
        let store = InMemoryNodeExecutionStore::new();
        let exec = queued_execution();
        let id = exec.id;
        store.insert(exec).await.unwrap();

        let err = store
            .update_status(id, NodeStatus::Queued, NodeStatus::Succeeded)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_sets_end_ts() {
        let store = InMemoryNodeExecutionStore::new();
        let exec = queued_execution();
        let id = exec.id;
        store.insert(exec).await.unwrap();

        store
            .update_status(id, NodeStatus::Queued, NodeStatus::Running)
            .await
            .unwrap();
        let done = store
            .update_status(id, NodeStatus::Running, NodeStatus::Succeeded)
            .await
            .unwrap();
        assert!(done.end_ts.is_some());
    }

    #[tokio::test]
    async fn test_by_run_filters() {
        let store = InMemoryNodeExecutionStore::new();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();
        store.insert(NodeExecution::new(run_a, "a1")).await.unwrap();
        store.insert(NodeExecution::new(run_a, "a2")).await.unwrap();
        store.insert(NodeExecution::new(run_b, "b1")).await.unwrap();

        assert_eq!(store.by_run(run_a).await.unwrap().len(), 2);
        assert_eq!(store.by_run(run_b).await.unwrap().len(), 1);
    }
}
