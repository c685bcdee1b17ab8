//! Mock collaborators and fixtures for exercising the engine.
//!
//! These are library code, not test-only: embedders use them to drive the
//! engine without real workers, the same way the crate's own tests do.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{CallbackId, RemoteTaskChannel, TaskDefinition, TaskResponse};
use crate::engine::{Adviser, OnFailRollbackAdviser, RollbackStrategy};
use crate::errors::EngineError;
use crate::execution::ExecutableResponse;
use crate::steps::{StepCapabilities, StepExecutor, StepInputs, StepResponse};

/// A scripted step executor that records its calls.
///
/// Sync responses are consumed from a queue; when the queue is empty the
/// executor succeeds with a `{"mock": <step_type>}` outcome. Async
/// facilitation produces a [`TaskDefinition`] carrying the node's
/// parameters.
#[derive(Debug)]
pub struct MockStepExecutor {
    step_type: String,
    capabilities: StepCapabilities,
    scripted: Mutex<VecDeque<StepResponse>>,
    task_timeout: Mutex<Option<Duration>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockStepExecutor {
    /// A sync-only executor that succeeds by default.
    #[must_use]
    pub fn sync(step_type: impl Into<String>) -> Self {
        Self::with_capabilities(step_type, StepCapabilities::sync_only())
    }

    /// An async-dispatch executor with the abort hook enabled.
    #[must_use]
    pub fn async_dispatch(step_type: impl Into<String>) -> Self {
        Self::with_capabilities(step_type, StepCapabilities::async_only().with_abort())
    }

    /// An executor with an explicit capability set.
    #[must_use]
    pub fn with_capabilities(step_type: impl Into<String>, capabilities: StepCapabilities) -> Self {
        Self {
            step_type: step_type.into(),
            capabilities,
            scripted: Mutex::new(VecDeque::new()),
            task_timeout: Mutex::new(None),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Queues a scripted sync response; consumed in order.
    #[must_use]
    pub fn with_response(self, response: StepResponse) -> Self {
        self.scripted.lock().push_back(response);
        self
    }

    /// Sets the timeout stamped on dispatched task definitions.
    #[must_use]
    pub fn with_task_timeout(self, timeout: Duration) -> Self {
        *self.task_timeout.lock() = Some(timeout);
        self
    }

    /// Delays sync execution, for exercising node timeouts.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Number of sync/async executions performed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of abort-hook invocations.
    #[must_use]
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> StepResponse {
        self.scripted.lock().pop_front().unwrap_or_else(|| {
            StepResponse::succeeded(serde_json::json!({ "mock": self.step_type }))
        })
    }
}

#[async_trait]
impl StepExecutor for MockStepExecutor {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn capabilities(&self) -> StepCapabilities {
        self.capabilities
    }

    async fn execute_sync(
        &self,
        _params: &serde_json::Value,
        _inputs: &StepInputs,
    ) -> Result<StepResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.next_response())
    }

    async fn execute_async(
        &self,
        params: &serde_json::Value,
        _inputs: &StepInputs,
    ) -> Result<TaskDefinition, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut task = TaskDefinition::new(self.step_type.clone(), params.clone());
        if let Some(timeout) = *self.task_timeout.lock() {
            task = task.with_timeout(timeout);
        }
        Ok(task)
    }

    async fn handle_abort(
        &self,
        _params: &serde_json::Value,
        _prior_response: Option<&ExecutableResponse>,
    ) -> Result<(), EngineError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A remote channel that captures dispatched tasks and never answers on its
/// own; tests inject responses through the correlator.
#[derive(Debug, Default)]
pub struct MockRemoteChannel {
    sent: Mutex<Vec<(CallbackId, TaskDefinition)>>,
    aborted: Mutex<Vec<CallbackId>>,
    fail_sends: AtomicBool,
}

impl MockRemoteChannel {
    /// Creates a channel that accepts every send.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send fail as channel-unavailable.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Tasks sent so far, with their callback ids.
    #[must_use]
    pub fn sent(&self) -> Vec<(CallbackId, TaskDefinition)> {
        self.sent.lock().clone()
    }

    /// The callback id of the most recent send.
    #[must_use]
    pub fn last_callback(&self) -> Option<CallbackId> {
        self.sent.lock().last().map(|(id, _)| id.clone())
    }

    /// Callback ids the engine asked to abort.
    #[must_use]
    pub fn aborted(&self) -> Vec<CallbackId> {
        self.aborted.lock().clone()
    }
}

#[async_trait]
impl RemoteTaskChannel for MockRemoteChannel {
    async fn send(
        &self,
        callback_id: &CallbackId,
        task: &TaskDefinition,
    ) -> Result<(), EngineError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::ChannelUnavailable(
                "mock channel refusing sends".to_string(),
            ));
        }
        self.sent.lock().push((callback_id.clone(), task.clone()));
        Ok(())
    }

    async fn send_sync(&self, _task: &TaskDefinition) -> Result<TaskResponse, EngineError> {
        Ok(TaskResponse::success(serde_json::Value::Null))
    }

    async fn abort(&self, callback_id: &CallbackId) -> Result<(), EngineError> {
        self.aborted.lock().push(callback_id.clone());
        Ok(())
    }
}

/// A stage-rollback adviser that redirects any broken outcome to `node_id`.
#[must_use]
pub fn stage_rollback_adviser(node_id: &str) -> Arc<dyn Adviser> {
    let mut map = std::collections::HashMap::new();
    map.insert(RollbackStrategy::StageRollback, node_id.to_string());
    Arc::new(OnFailRollbackAdviser::new(RollbackStrategy::StageRollback, map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{FailureInfo, FailureType, NodeStatus};

    #[tokio::test]
    async fn test_mock_step_consumes_scripted_responses_in_order() {
        let step = MockStepExecutor::sync("shell")
            .with_response(StepResponse::failed(FailureInfo::new(
                "first try breaks",
                FailureType::ApplicationError,
            )));

        let first = step
            .execute_sync(&serde_json::Value::Null, &StepInputs::default())
            .await
            .unwrap();
        assert_eq!(first.status, NodeStatus::Failed);

        let second = step
            .execute_sync(&serde_json::Value::Null, &StepInputs::default())
            .await
            .unwrap();
        assert_eq!(second.status, NodeStatus::Succeeded);
        assert_eq!(step.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_channel_records_sends_and_aborts() {
        let channel = MockRemoteChannel::new();
        let callback_id = CallbackId::generate();
        let task = TaskDefinition::new("http", serde_json::json!({}));

        channel.send(&callback_id, &task).await.unwrap();
        assert_eq!(channel.last_callback(), Some(callback_id.clone()));

        channel.abort(&callback_id).await.unwrap();
        assert_eq!(channel.aborted(), vec![callback_id]);

        channel.fail_sends(true);
        let err = channel
            .send(&CallbackId::generate(), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChannelUnavailable(_)));
    }
}
