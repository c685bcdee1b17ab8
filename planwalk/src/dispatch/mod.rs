//! Asynchronous task dispatch and callback correlation.
//!
//! `dispatch` hands a task description to the remote channel and returns
//! immediately with an opaque callback id; the dispatching branch parks on
//! the returned receiver. Exactly one of a real response, an abort, or the
//! task's timeout resolves the callback. Resolution is an atomic
//! take-and-remove from a concurrent map, so a callback id is single-use: a
//! second response for the same id is dropped with a logged warning and
//! never re-enters the state machine.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::execution::FailureInfo;

/// Opaque correlation token linking a dispatched task to the waiting node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(String);

impl CallbackId {
    /// Generates a fresh callback id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing id (resume path).
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of work handed to a remote worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// The remote task type.
    pub task_type: String,
    /// Serialized task parameters.
    pub parameters: serde_json::Value,
    /// How long to wait for a response before synthesizing a timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Target-selection constraints.
    pub selectors: Vec<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?))
    }
}

impl TaskDefinition {
    /// Creates a task definition with a default 10-minute timeout.
    #[must_use]
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            timeout: Duration::from_secs(600),
            selectors: Vec::new(),
        }
    }

    /// Sets the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a target-selection constraint.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push(selector.into());
        self
    }
}

/// A response delivered (or synthesized) for a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// The response payload.
    pub payload: serde_json::Value,
    /// Failure classification, if the task did not succeed.
    pub failure_info: Option<FailureInfo>,
}

impl TaskResponse {
    /// A successful response.
    #[must_use]
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            payload,
            failure_info: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failure(failure_info: FailureInfo) -> Self {
        Self {
            payload: serde_json::Value::Null,
            failure_info: Some(failure_info),
        }
    }

    /// The response the correlator synthesizes when a timeout fires.
    #[must_use]
    pub fn timed_out(timeout: Duration) -> Self {
        Self::failure(FailureInfo::timeout(format!(
            "no response within {timeout:?}"
        )))
    }

    /// Returns true if the response carries a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failure_info.is_some()
    }
}

/// Remote execution channel (external collaborator).
#[async_trait]
pub trait RemoteTaskChannel: Send + Sync {
    /// Sends the task fire-and-forget; the response arrives out-of-band
    /// correlated by the callback id. Must not block on the remote result.
    async fn send(
        &self,
        callback_id: &CallbackId,
        task: &TaskDefinition,
    ) -> Result<(), EngineError>;

    /// Blocking variant for short operations.
    async fn send_sync(&self, task: &TaskDefinition) -> Result<TaskResponse, EngineError>;

    /// Asks the remote side to abandon the task.
    async fn abort(&self, callback_id: &CallbackId) -> Result<(), EngineError>;
}

/// Outcome of delivering a response to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The callback was pending and is now resolved.
    Resolved {
        /// The node execution that was waiting on it.
        node_execution_id: Uuid,
    },
    /// The callback id was unknown or already resolved; the response was
    /// dropped.
    Dropped,
}

struct PendingCallback {
    node_execution_id: Uuid,
    tx: oneshot::Sender<TaskResponse>,
    timeout_task: tokio::task::JoinHandle<()>,
}

/// Maps outstanding remote-task callback ids to waiting executions.
pub struct TaskDispatchCorrelator {
    channel: Arc<dyn RemoteTaskChannel>,
    pending: DashMap<CallbackId, PendingCallback>,
}

impl TaskDispatchCorrelator {
    /// Creates a correlator over a remote task channel.
    #[must_use]
    pub fn new(channel: Arc<dyn RemoteTaskChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            pending: DashMap::new(),
        })
    }

    /// Dispatches a task and registers its callback.
    ///
    /// Returns the callback id and the receiver the dispatching branch
    /// parks on. The call returns as soon as the channel accepts the task;
    /// it never waits for the remote result.
    pub async fn dispatch(
        self: &Arc<Self>,
        node_execution_id: Uuid,
        task: &TaskDefinition,
    ) -> Result<(CallbackId, oneshot::Receiver<TaskResponse>), EngineError> {
        let callback_id = CallbackId::generate();
        let rx = self.register(callback_id.clone(), node_execution_id, task.timeout);

        if let Err(err) = self.channel.send(&callback_id, task).await {
            if let Some((_, entry)) = self.pending.remove(&callback_id) {
                entry.timeout_task.abort();
            }
            return Err(err);
        }
        Ok((callback_id, rx))
    }

    /// Registers a callback entry without sending, used when re-driving a
    /// node whose task was already dispatched before a restart.
    pub fn register(
        self: &Arc<Self>,
        callback_id: CallbackId,
        node_execution_id: Uuid,
        timeout: Duration,
    ) -> oneshot::Receiver<TaskResponse> {
        let (tx, rx) = oneshot::channel();
        let timeout_task = self.spawn_timeout(callback_id.clone(), timeout);
        self.pending.insert(
            callback_id,
            PendingCallback {
                node_execution_id,
                tx,
                timeout_task,
            },
        );
        rx
    }

    /// Delivers a response for a callback id.
    ///
    /// Single-use: the entry is removed atomically; a second response for
    /// the same id is a protocol error, logged and dropped.
    pub fn on_response(&self, callback_id: &CallbackId, response: TaskResponse) -> Resolution {
        match self.pending.remove(callback_id) {
            Some((_, entry)) => {
                entry.timeout_task.abort();
                let node_execution_id = entry.node_execution_id;
                // Receiver dropped means the branch stopped waiting.
                let _ = entry.tx.send(response);
                debug!(callback_id = %callback_id, "callback resolved");
                Resolution::Resolved { node_execution_id }
            }
            None => {
                warn!(
                    callback_id = %callback_id,
                    "duplicate or unknown callback response dropped"
                );
                Resolution::Dropped
            }
        }
    }

    /// Abandons a pending callback: removes the entry, cancels its timer,
    /// and tells the channel to abort the remote task.
    pub async fn abort(&self, callback_id: &CallbackId) -> Result<bool, EngineError> {
        match self.pending.remove(callback_id) {
            Some((_, entry)) => {
                entry.timeout_task.abort();
                self.channel.abort(callback_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of callbacks still outstanding.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn spawn_timeout(
        self: &Arc<Self>,
        callback_id: CallbackId,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let correlator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = correlator.upgrade() {
                if let Some((_, entry)) = correlator.pending.remove(&callback_id) {
                    warn!(
                        callback_id = %callback_id,
                        ?timeout,
                        "task timed out; synthesizing timeout failure"
                    );
                    let _ = entry.tx.send(TaskResponse::timed_out(timeout));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::FailureType;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Channel that records sends and never responds on its own.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(CallbackId, TaskDefinition)>>,
        aborted: Mutex<Vec<CallbackId>>,
    }

    #[async_trait]
    impl RemoteTaskChannel for RecordingChannel {
        async fn send(
            &self,
            callback_id: &CallbackId,
            task: &TaskDefinition,
        ) -> Result<(), EngineError> {
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

    fn task(timeout: Duration) -> TaskDefinition {
        TaskDefinition::new("http", serde_json::json!({"url": "https://example"}))
            .with_timeout(timeout)
    }

    #[tokio::test]
    async fn test_dispatch_returns_without_blocking() {
        let channel = Arc::new(RecordingChannel::default());
        let correlator = TaskDispatchCorrelator::new(channel.clone());

        let node_id = Uuid::new_v4();
        let (callback_id, _rx) = correlator
            .dispatch(node_id, &task(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(correlator.pending_count(), 1);
        let sent = channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, callback_id);
    }

    #[tokio::test]
    async fn test_response_resolves_waiting_branch() {
        let correlator = TaskDispatchCorrelator::new(Arc::new(RecordingChannel::default()));
        let node_id = Uuid::new_v4();
        let (callback_id, rx) = correlator
            .dispatch(node_id, &task(Duration::from_secs(60)))
            .await
            .unwrap();

        let resolution =
            correlator.on_response(&callback_id, TaskResponse::success(serde_json::json!(42)));
        assert_eq!(
            resolution,
            Resolution::Resolved { node_execution_id: node_id }
        );

        let response = rx.await.unwrap();
        assert_eq!(response.payload, serde_json::json!(42));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_response_is_dropped() {
        let correlator = TaskDispatchCorrelator::new(Arc::new(RecordingChannel::default()));
        let (callback_id, _rx) = correlator
            .dispatch(Uuid::new_v4(), &task(Duration::from_secs(60)))
            .await
            .unwrap();

        let first =
            correlator.on_response(&callback_id, TaskResponse::success(serde_json::json!(1)));
        assert!(matches!(first, Resolution::Resolved { .. }));

        let second =
            correlator.on_response(&callback_id, TaskResponse::success(serde_json::json!(2)));
        assert_eq!(second, Resolution::Dropped);
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_failure() {
        let correlator = TaskDispatchCorrelator::new(Arc::new(RecordingChannel::default()));
        let (_callback_id, rx) = correlator
            .dispatch(Uuid::new_v4(), &task(Duration::from_millis(20)))
            .await
            .unwrap();

        let response = rx.await.unwrap();
        assert!(response.is_failure());
        let failure = response.failure_info.unwrap();
        assert!(failure.failure_types.contains(&FailureType::Timeout));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_removes_entry_and_notifies_channel() {
        let channel = Arc::new(RecordingChannel::default());
        let correlator = TaskDispatchCorrelator::new(channel.clone());
        let (callback_id, _rx) = correlator
            .dispatch(Uuid::new_v4(), &task(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(correlator.abort(&callback_id).await.unwrap());
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(channel.aborted.lock().len(), 1);

        // Aborting twice is a no-op.
        assert!(!correlator.abort(&callback_id).await.unwrap());

        // A response after abort is dropped, never re-applied.
        let resolution =
            correlator.on_response(&callback_id, TaskResponse::success(serde_json::json!(1)));
        assert_eq!(resolution, Resolution::Dropped);
    }

    #[tokio::test]
    async fn test_reregister_supports_resume() {
        let correlator = TaskDispatchCorrelator::new(Arc::new(RecordingChannel::default()));
        let callback_id = CallbackId::from_string("persisted-id");
        let node_id = Uuid::new_v4();

        let rx = correlator.register(callback_id.clone(), node_id, Duration::from_secs(60));
        let resolution =
            correlator.on_response(&callback_id, TaskResponse::success(serde_json::json!("ok")));
        assert_eq!(
            resolution,
            Resolution::Resolved { node_execution_id: node_id }
        );
        assert_eq!(rx.await.unwrap().payload, serde_json::json!("ok"));
    }
}
