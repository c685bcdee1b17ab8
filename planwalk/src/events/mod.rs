//! Engine event sink for observability.
//!
//! The engine emits a lifecycle event for every node transition it drives.
//! Sinks are fire-and-forget: a sink must never fail the engine.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::execution::NodeStatus;

/// A node/run lifecycle event emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A node execution record was created.
    NodeQueued {
        /// The execution record id.
        node_execution_id: Uuid,
        /// The plan node id.
        plan_node_id: String,
    },
    /// A node began running.
    NodeStarted {
        /// The execution record id.
        node_execution_id: Uuid,
        /// The plan node id.
        plan_node_id: String,
    },
    /// A node parked on a barrier or a remote callback.
    NodeWaiting {
        /// The execution record id.
        node_execution_id: Uuid,
        /// What the node is waiting on.
        reason: String,
    },
    /// A waiting node resumed running.
    NodeResumed {
        /// The execution record id.
        node_execution_id: Uuid,
    },
    /// A node reached a terminal status.
    NodeTerminal {
        /// The execution record id.
        node_execution_id: Uuid,
        /// The plan node id.
        plan_node_id: String,
        /// The terminal status.
        status: NodeStatus,
    },
    /// An adviser redirected flow after a terminal outcome.
    AdviceIssued {
        /// The plan node the advice was issued for.
        plan_node_id: String,
        /// A short description of the advice.
        advice: String,
    },
    /// A barrier went down and released its waiters.
    BarrierDown {
        /// The barrier identifier.
        identifier: String,
    },
    /// A run finished with a reduced status.
    RunFinished {
        /// The run id.
        run_id: Uuid,
        /// The reduced terminal status.
        status: NodeStatus,
    },
}

/// Receives engine lifecycle events.
#[async_trait]
pub trait EngineEventSink: Send + Sync {
    /// Emits an event. Must not fail; errors are the sink's problem.
    async fn emit(&self, event: &EngineEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EngineEventSink for NoOpEventSink {
    async fn emit(&self, _event: &EngineEvent) {}
}

/// A sink that logs events through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

#[async_trait]
impl EngineEventSink for LoggingEventSink {
    async fn emit(&self, event: &EngineEvent) {
        info!(event = ?event, "engine event");
    }
}
