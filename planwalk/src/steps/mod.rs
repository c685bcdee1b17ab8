//! Step executor boundary.
//!
//! A step declares which capability set it implements ({sync}, {async},
//! {sync, async}) and the engine dispatches on that set; the default trait
//! methods return a capability violation so a step only implements the
//! entry points it declared. Step types are plug-in payloads executed
//! *through* the engine — the kernel knows nothing about their semantics.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::dispatch::{TaskDefinition, TaskResponse};
use crate::errors::EngineError;
use crate::execution::{ExecutableResponse, FailureInfo, NodeStatus};

/// The capability set a step executor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepCapabilities {
    /// Supports in-process synchronous execution.
    pub sync: bool,
    /// Supports asynchronous dispatch to a remote worker.
    pub async_dispatch: bool,
    /// Supports the abort hook for in-flight remote work.
    pub abortable: bool,
}

impl StepCapabilities {
    /// Sync-only step.
    #[must_use]
    pub fn sync_only() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }

    /// Async-only step.
    #[must_use]
    pub fn async_only() -> Self {
        Self {
            async_dispatch: true,
            ..Self::default()
        }
    }

    /// Step supporting both entry points.
    #[must_use]
    pub fn sync_and_async() -> Self {
        Self {
            sync: true,
            async_dispatch: true,
            abortable: false,
        }
    }

    /// Enables the abort hook.
    #[must_use]
    pub fn with_abort(mut self) -> Self {
        self.abortable = true;
        self
    }
}

/// Inputs visible to a step at execution time.
#[derive(Debug, Clone, Default)]
pub struct StepInputs {
    /// The run-level context.
    pub run_context: serde_json::Value,
    /// Outcomes of previously completed nodes in this branch, by plan
    /// node id.
    pub prior_outcomes: HashMap<String, serde_json::Value>,
}

/// The result a step executor reports for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResponse {
    /// The terminal status the node should take.
    pub status: NodeStatus,
    /// The step's outcome payload.
    pub outcome: serde_json::Value,
    /// Failure classification when the status is broken.
    pub failure_info: Option<FailureInfo>,
}

impl StepResponse {
    /// A successful response.
    #[must_use]
    pub fn succeeded(outcome: serde_json::Value) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            outcome,
            failure_info: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: NodeStatus::Failed,
            outcome: serde_json::Value::Null,
            failure_info: Some(failure_info),
        }
    }

    /// A failed response with a partial outcome payload.
    #[must_use]
    pub fn failed_with_outcome(failure_info: FailureInfo, outcome: serde_json::Value) -> Self {
        Self {
            status: NodeStatus::Failed,
            outcome,
            failure_info: Some(failure_info),
        }
    }
}

/// One step type's executor (external collaborator).
#[async_trait]
pub trait StepExecutor: Send + Sync + Debug {
    /// The step type this executor handles.
    fn step_type(&self) -> &str;

    /// The capability set this executor implements.
    fn capabilities(&self) -> StepCapabilities;

    /// Executes the step in-process and returns its response immediately.
    async fn execute_sync(
        &self,
        _params: &serde_json::Value,
        _inputs: &StepInputs,
    ) -> Result<StepResponse, EngineError> {
        Err(EngineError::CapabilityViolation {
            step_type: self.step_type().to_string(),
            capability: "sync",
        })
    }

    /// Produces the task definition for asynchronous dispatch. The engine
    /// sends it through the correlator; the step never blocks on the
    /// remote result.
    async fn execute_async(
        &self,
        _params: &serde_json::Value,
        _inputs: &StepInputs,
    ) -> Result<TaskDefinition, EngineError> {
        Err(EngineError::CapabilityViolation {
            step_type: self.step_type().to_string(),
            capability: "async",
        })
    }

    /// Interprets the remote response once the callback resolves.
    async fn handle_async_response(
        &self,
        _params: &serde_json::Value,
        response: &TaskResponse,
    ) -> Result<StepResponse, EngineError> {
        // Default mapping: a failed task fails the node, a successful one
        // succeeds with the raw payload as outcome.
        Ok(match &response.failure_info {
            Some(failure) => StepResponse::failed(failure.clone()),
            None => StepResponse::succeeded(response.payload.clone()),
        })
    }

    /// Abort hook for in-flight remote work.
    async fn handle_abort(
        &self,
        _params: &serde_json::Value,
        _prior_response: Option<&ExecutableResponse>,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Registry resolving step types to executors.
///
/// An unknown step type is a fatal engine error: the run aborts and is not
/// retried.
#[derive(Debug, Default)]
pub struct StepRegistry {
    executors: RwLock<HashMap<String, Arc<dyn StepExecutor>>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor under its step type.
    pub fn register(&self, executor: Arc<dyn StepExecutor>) {
        let step_type = executor.step_type().to_string();
        self.executors.write().insert(step_type, executor);
    }

    /// Resolves an executor for a step type.
    pub fn resolve(&self, step_type: &str) -> Result<Arc<dyn StepExecutor>, EngineError> {
        self.executors
            .read()
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStepType {
                step_type: step_type.to_string(),
            })
    }

    /// Number of registered step types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executors.read().len()
    }

    /// Returns true if no executors are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct SyncOnlyStep;

    #[async_trait]
    impl StepExecutor for SyncOnlyStep {
        fn step_type(&self) -> &str {
            "sync-only"
        }

        fn capabilities(&self) -> StepCapabilities {
            StepCapabilities::sync_only()
        }

        async fn execute_sync(
            &self,
            _params: &serde_json::Value,
            _inputs: &StepInputs,
        ) -> Result<StepResponse, EngineError> {
            Ok(StepResponse::succeeded(serde_json::json!("done")))
        }
    }

    #[tokio::test]
    async fn test_unimplemented_entry_point_is_a_capability_violation() {
        let step = SyncOnlyStep;
        let err = step
            .execute_async(&serde_json::Value::Null, &StepInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapabilityViolation { capability: "async", .. }
        ));
    }

    #[tokio::test]
    async fn test_default_async_response_mapping() {
        let step = SyncOnlyStep;

        let ok = step
            .handle_async_response(
                &serde_json::Value::Null,
                &TaskResponse::success(serde_json::json!({"out": 1})),
            )
            .await
            .unwrap();
        assert_eq!(ok.status, NodeStatus::Succeeded);
        assert_eq!(ok.outcome, serde_json::json!({"out": 1}));

        let failed = step
            .handle_async_response(
                &serde_json::Value::Null,
                &TaskResponse::failure(FailureInfo::timeout("too slow")),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, NodeStatus::Failed);
        assert!(failed.failure_info.is_some());
    }

    #[test]
    fn test_registry_resolves_by_step_type() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(SyncOnlyStep));

        assert!(registry.resolve("sync-only").is_ok());
        let err = registry.resolve("ghost").unwrap_err();
        assert!(matches!(err, EngineError::UnknownStepType { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_capability_builders() {
        let caps = StepCapabilities::async_only().with_abort();
        assert!(!caps.sync);
        assert!(caps.async_dispatch);
        assert!(caps.abortable);
    }
}
