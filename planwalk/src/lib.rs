//! # Planwalk
//!
//! A distributed pipeline execution kernel.
//!
//! Planwalk turns a declarative, immutable plan graph into a running,
//! resumable, partially-failable computation:
//!
//! - **Node state machine**: each plan node runs through a persisted
//!   `Queued -> Running -> terminal` state machine with optimistic,
//!   status-preconditioned updates
//! - **Barrier rendezvous**: parallel branches synchronize at named
//!   barriers that go down exactly once
//! - **Async task correlation**: remote work is dispatched fire-and-forget
//!   and resumed later via single-use callback ids, with timeout synthesis
//! - **Adviser chain**: terminal failures are classified and routed to
//!   rollback, retry, or ignore strategies
//! - **Idempotent locks**: non-idempotent operations are guarded so retries
//!   reuse the cached result instead of re-executing side effects
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use planwalk::prelude::*;
//!
//! let plan = PlanBuilder::new()
//!     .node(PlanNode::builder("deploy", "shell").build())
//!     .start_at("deploy")
//!     .build()?;
//!
//! let report = engine.run(&plan, serde_json::json!({})).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod barrier;
pub mod cancellation;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod events;
pub mod execution;
pub mod idempotency;
pub mod plan;
pub mod steps;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::barrier::{
        ArrivalOutcome, BarrierCoordinator, BarrierInstance, BarrierState,
        BarrierStore, InMemoryBarrierStore,
    };
    pub use crate::cancellation::RunCancellation;
    pub use crate::dispatch::{
        CallbackId, RemoteTaskChannel, Resolution, TaskDefinition,
        TaskDispatchCorrelator, TaskResponse,
    };
    pub use crate::engine::{
        Adviser, AdviserResponse, AdviseEvent, BackoffPolicy, EngineConfig,
        IgnoreFailureAdviser, NodeExecutionEngine, OnFailRollbackAdviser,
        RetryAdviser, RollbackStrategy, RunReport,
    };
    pub use crate::errors::{EngineError, PlanValidationError};
    pub use crate::events::{EngineEvent, EngineEventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::execution::{
        ExecutableResponse, FailureInfo, FailureType, InMemoryNodeExecutionStore,
        InterruptKind, InterruptRecord, NodeExecution, NodeExecutionStore,
        NodeStatus,
    };
    pub use crate::idempotency::{
        IdempotencyRegistry, IdempotentId, IdempotentLock, IdempotentLockConfig,
        LockAcquisition, Registration, RegistryConfig,
    };
    pub use crate::plan::{
        FacilitatorMode, Plan, PlanBuilder, PlanNode, PlanNodeBuilder,
        SkipCondition,
    };
    pub use crate::steps::{
        StepCapabilities, StepExecutor, StepInputs, StepRegistry, StepResponse,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        assert!(true);
    }
}
