//! The node execution engine: walks a plan, drives each node through the
//! persisted state machine, and reacts to terminal outcomes through the
//! adviser chain.
//!
//! The engine is transition-then-act: every status change is persisted via
//! the store's conditional update before the engine acts on it, so a
//! crashed run can be re-driven from persisted state with
//! [`NodeExecutionEngine::resume_run`].

mod advisers;
mod backoff;

pub use advisers::{
    advise, AdviseEvent, Adviser, AdviserResponse, IgnoreFailureAdviser,
    OnFailRollbackAdviser, RetryAdviser, RollbackStrategy,
};
pub use backoff::{retry_transient, BackoffPolicy};

use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::barrier::{ArrivalOutcome, BarrierCoordinator};
use crate::cancellation::RunCancellation;
use crate::dispatch::{CallbackId, TaskDispatchCorrelator};
use crate::errors::EngineError;
use crate::events::{EngineEvent, EngineEventSink, NoOpEventSink};
use crate::execution::{
    ExecutableResponse, FailureInfo, FailureType, InterruptKind, InterruptRecord,
    NodeExecution, NodeExecutionStore, NodeStatus,
};
use crate::idempotency::{
    IdempotencyRegistry, IdempotentId, IdempotentLock, IdempotentLockConfig, LockAcquisition,
};
use crate::plan::{FacilitatorMode, Plan, PlanNode};
use crate::steps::{StepInputs, StepRegistry, StepResponse};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Acquisition policy for the per-dispatch idempotent lock.
    pub dispatch_lock: IdempotentLockConfig,
    /// Backoff applied to transient store/channel errors.
    pub store_backoff: BackoffPolicy,
    /// Timeout re-armed for a persisted callback when a run is resumed.
    pub resume_callback_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_lock: IdempotentLockConfig::default(),
            store_backoff: BackoffPolicy::default(),
            resume_callback_timeout: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dispatch-lock acquisition policy.
    #[must_use]
    pub fn with_dispatch_lock(mut self, config: IdempotentLockConfig) -> Self {
        self.dispatch_lock = config;
        self
    }

    /// Sets the transient-error backoff policy.
    #[must_use]
    pub fn with_store_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.store_backoff = policy;
        self
    }

    /// Sets the timeout re-armed for persisted callbacks on resume.
    #[must_use]
    pub fn with_resume_callback_timeout(mut self, timeout: Duration) -> Self {
        self.resume_callback_timeout = timeout;
        self
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The run id.
    pub run_id: Uuid,
    /// The plan that was walked.
    pub plan_id: Uuid,
    /// The reduced terminal status of the run.
    pub status: NodeStatus,
    /// The failure that ended the run, if it broke.
    pub failure_info: Option<FailureInfo>,
    /// Every execution record the run produced.
    pub executions: Vec<NodeExecution>,
}

impl RunReport {
    /// Returns true if the run ended successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }

    /// Looks up the latest execution of a plan node.
    #[must_use]
    pub fn execution_of(&self, plan_node_id: &str) -> Option<&NodeExecution> {
        self.executions
            .iter()
            .filter(|e| e.plan_node_id == plan_node_id)
            .max_by_key(|e| e.attempt_count())
    }
}

/// Reduced outcome of one branch walk.
#[derive(Debug, Clone)]
struct BranchOutcome {
    status: NodeStatus,
    failure: Option<FailureInfo>,
}

impl BranchOutcome {
    fn ok() -> Self {
        Self {
            status: NodeStatus::Succeeded,
            failure: None,
        }
    }

    fn broken(status: NodeStatus, failure: Option<FailureInfo>) -> Self {
        Self { status, failure }
    }
}

/// What the step work produced, before the terminal transition is persisted.
#[derive(Debug)]
struct StepVerdict {
    status: NodeStatus,
    outcome: serde_json::Value,
    failure: Option<FailureInfo>,
}

impl From<StepResponse> for StepVerdict {
    fn from(response: StepResponse) -> Self {
        Self {
            status: response.status,
            outcome: response.outcome,
            failure: response.failure_info,
        }
    }
}

/// Result of facilitating a node's own work.
#[derive(Debug)]
enum Facilitated {
    /// Work produced a verdict; the record is still `Running` and the
    /// engine persists the terminal transition (after any barrier).
    Verdict(StepVerdict),
    /// An abort or expiry path already persisted the terminal record.
    AlreadyTerminal(NodeExecution),
}

/// What the branch walker does after a node terminates.
#[derive(Debug)]
enum NextMove {
    /// Walk on to another plan node with a fresh attempt.
    Goto(String),
    /// Jump to a rollback entry point. The originating broken outcome is
    /// carried along: a rolled-back branch never reduces to success, no
    /// matter how the rollback nodes fare.
    Rollback {
        node_id: String,
        broken: BranchOutcome,
    },
    /// Re-run the same plan node, linked to the prior attempt.
    RetrySame(String, NodeExecution),
    /// The branch is finished.
    Finish(BranchOutcome),
}

/// Shared per-run state threaded through the branch walkers.
struct RunScope<'p> {
    run_id: Uuid,
    plan: &'p Plan,
    context: serde_json::Value,
    cancellation: Arc<RunCancellation>,
}

impl RunScope<'_> {
    fn fresh_inputs(&self) -> StepInputs {
        StepInputs {
            run_context: self.context.clone(),
            prior_outcomes: HashMap::new(),
        }
    }
}

/// Walks plans: facilitates each node, synchronizes branches at barriers,
/// and routes terminal failures through the adviser chain.
pub struct NodeExecutionEngine {
    store: Arc<dyn NodeExecutionStore>,
    barriers: Arc<BarrierCoordinator>,
    correlator: Arc<TaskDispatchCorrelator>,
    steps: Arc<StepRegistry>,
    idempotency: Arc<IdempotencyRegistry>,
    sink: Arc<dyn EngineEventSink>,
    config: EngineConfig,
    cancellations: DashMap<Uuid, Arc<RunCancellation>>,
}

impl NodeExecutionEngine {
    /// Creates an engine over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn NodeExecutionStore>,
        barriers: Arc<BarrierCoordinator>,
        correlator: Arc<TaskDispatchCorrelator>,
        steps: Arc<StepRegistry>,
    ) -> Self {
        Self {
            store,
            barriers,
            correlator,
            steps,
            idempotency: Arc::new(IdempotencyRegistry::default()),
            sink: Arc::new(NoOpEventSink),
            config: EngineConfig::default(),
            cancellations: DashMap::new(),
        }
    }

    /// Replaces the idempotency registry.
    #[must_use]
    pub fn with_idempotency_registry(mut self, registry: Arc<IdempotencyRegistry>) -> Self {
        self.idempotency = registry;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EngineEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Delivers an out-of-band remote task response into the engine.
    ///
    /// The parked branch is woken through the correlator; the callback id is
    /// single-use, so a duplicate delivery is dropped there.
    pub fn deliver_response(
        &self,
        callback_id: &CallbackId,
        response: crate::dispatch::TaskResponse,
    ) -> crate::dispatch::Resolution {
        self.correlator.on_response(callback_id, response)
    }

    /// Ids of runs currently being driven by this engine.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.cancellations.iter().map(|entry| *entry.key()).collect()
    }

    /// Requests a run abort. Returns false if the run is not active.
    pub fn abort_run(&self, run_id: Uuid, reason: impl Into<String>) -> bool {
        match self.cancellations.get(&run_id) {
            Some(cancellation) => {
                let reason = reason.into();
                info!(%run_id, %reason, "run abort requested");
                cancellation.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Runs a plan to completion and returns its report.
    pub async fn run(
        &self,
        plan: &Plan,
        run_context: serde_json::Value,
    ) -> Result<RunReport, EngineError> {
        let run_id = Uuid::new_v4();
        let cancellation = Arc::new(RunCancellation::new());
        self.cancellations.insert(run_id, Arc::clone(&cancellation));

        let scope = RunScope {
            run_id,
            plan,
            context: run_context,
            cancellation,
        };
        info!(%run_id, plan_id = %plan.id(), nodes = plan.node_count(), "run started");

        let inputs = scope.fresh_inputs();
        let result = self
            .execute_branch(&scope, plan.start_id().to_string(), inputs, None)
            .await;
        self.cancellations.remove(&run_id);

        self.build_report(&scope, result?).await
    }

    /// Re-drives a run from persisted state after a crash or restart.
    ///
    /// Waiting nodes whose callback id was persisted get their callback
    /// re-armed; waiting barrier participants re-arrive (idempotent per
    /// plan node); anything caught `Queued`/`Running` is closed out as
    /// aborted and re-attempted as a linked retry.
    pub async fn resume_run(
        &self,
        plan: &Plan,
        run_id: Uuid,
        run_context: serde_json::Value,
    ) -> Result<RunReport, EngineError> {
        let cancellation = Arc::new(RunCancellation::new());
        self.cancellations.insert(run_id, Arc::clone(&cancellation));

        let scope = RunScope {
            run_id,
            plan,
            context: run_context,
            cancellation,
        };

        let result = self.drive_resume(&scope).await;
        self.cancellations.remove(&run_id);

        self.build_report(&scope, result?).await
    }

    async fn drive_resume(&self, scope: &RunScope<'_>) -> Result<BranchOutcome, EngineError> {
        let records = self
            .retry_store(|| self.store.by_run(scope.run_id))
            .await?;
        let open: Vec<NodeExecution> = records
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();

        if open.is_empty() {
            // Nothing survived in flight; walk from the start.
            return self
                .execute_branch(
                    scope,
                    scope.plan.start_id().to_string(),
                    scope.fresh_inputs(),
                    None,
                )
                .await;
        }

        info!(run_id = %scope.run_id, open = open.len(), "resuming run");
        let mut drives: Vec<BoxFuture<'_, Result<BranchOutcome, EngineError>>> = Vec::new();

        for record in open {
            let node = Self::node_of(scope, &record.plan_node_id)?.clone();

            if record.status == NodeStatus::Waiting && Self::is_resumable_wait(&node, &record) {
                drives.push(self.resume_branch(scope, node, record));
                continue;
            }

            // Caught mid-flight with nothing to re-arm: close the attempt
            // out and re-drive the branch as a linked retry.
            self.retry_store(|| {
                self.store.record_interrupt(
                    record.id,
                    InterruptRecord::new(InterruptKind::Retry, "re-driven after restart"),
                )
            })
            .await?;
            self.retry_store(|| {
                self.store
                    .update_status(record.id, record.status, NodeStatus::Aborted)
            })
            .await?;

            let start_id = record.plan_node_id.clone();
            drives.push(self.execute_branch(scope, start_id, scope.fresh_inputs(), Some(record)));
        }

        let outcomes = try_join_all(drives).await?;
        Ok(Self::reduce(outcomes))
    }

    fn is_resumable_wait(node: &PlanNode, record: &NodeExecution) -> bool {
        if node.barrier_identifier.is_some() {
            return true;
        }
        node.facilitator_mode == FacilitatorMode::Async
            && Self::persisted_callback(record).is_some()
    }

    fn resume_branch<'a>(
        &'a self,
        scope: &'a RunScope<'_>,
        node: Arc<PlanNode>,
        record: NodeExecution,
    ) -> BoxFuture<'a, Result<BranchOutcome, EngineError>> {
        async move {
            let finished = self.resume_waiting(scope, &node, record).await?;
            self.emit(EngineEvent::NodeTerminal {
                node_execution_id: finished.id,
                plan_node_id: node.id.clone(),
                status: finished.status,
            })
            .await;

            match self.after_terminal(scope, &node, finished).await? {
                NextMove::Goto(next) => {
                    self.execute_branch(scope, next, scope.fresh_inputs(), None)
                        .await
                }
                NextMove::Rollback { node_id, broken } => {
                    self.execute_branch(scope, node_id, scope.fresh_inputs(), None)
                        .await?;
                    Ok(broken)
                }
                NextMove::RetrySame(id, previous) => {
                    self.execute_branch(scope, id, scope.fresh_inputs(), Some(previous))
                        .await
                }
                NextMove::Finish(outcome) => Ok(outcome),
            }
        }
        .boxed()
    }

    /// Brings one persisted `Waiting` record to a terminal status.
    async fn resume_waiting(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        record: NodeExecution,
    ) -> Result<NodeExecution, EngineError> {
        if let Some(callback_id) = Self::persisted_callback(&record) {
            let timeout = node.timeout.unwrap_or(self.config.resume_callback_timeout);
            let rx = self
                .correlator
                .register(callback_id.clone(), record.id, timeout);

            let response = tokio::select! {
                () = scope.cancellation.cancelled() => {
                    let _ = self.correlator.abort(&callback_id).await;
                    return self.mark_aborted(scope, record.id, NodeStatus::Waiting).await;
                }
                res = rx => res.unwrap_or_else(|_| {
                    crate::dispatch::TaskResponse::failure(FailureInfo::new(
                        "callback dropped without a response",
                        FailureType::Connectivity,
                    ))
                }),
            };

            self.retry_store(|| {
                self.store
                    .update_status(record.id, NodeStatus::Waiting, NodeStatus::Running)
            })
            .await?;
            self.emit(EngineEvent::NodeResumed {
                node_execution_id: record.id,
            })
            .await;

            let executor = self.steps.resolve(&node.step_type)?;
            let verdict = match executor
                .handle_async_response(&node.step_parameters, &response)
                .await
            {
                Ok(step_response) => StepVerdict::from(step_response),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => StepVerdict {
                    status: NodeStatus::Failed,
                    outcome: serde_json::Value::Null,
                    failure: Some(FailureInfo::new(
                        err.to_string(),
                        FailureType::ApplicationError,
                    )),
                },
            };
            return self.settle(scope, node, record.id, verdict).await;
        }

        // Barrier participant: re-arrival is idempotent per plan node, so a
        // re-driven wait cannot double-count.
        if let Some(identifier) = node.barrier_identifier.clone() {
            if let Some(aborted) = self
                .await_barrier(scope, node, record.id, &identifier)
                .await?
            {
                return Ok(aborted);
            }
            self.retry_store(|| {
                self.store
                    .update_status(record.id, NodeStatus::Waiting, NodeStatus::Running)
            })
            .await?;
            self.emit(EngineEvent::NodeResumed {
                node_execution_id: record.id,
            })
            .await;
            return self
                .retry_store(|| {
                    self.store
                        .update_status(record.id, NodeStatus::Running, NodeStatus::Succeeded)
                })
                .await;
        }

        self.mark_aborted(scope, record.id, NodeStatus::Waiting).await
    }

    fn persisted_callback(record: &NodeExecution) -> Option<CallbackId> {
        record.executable_responses.iter().rev().find_map(|r| {
            r.payload
                .get("callback_id")
                .and_then(serde_json::Value::as_str)
                .map(CallbackId::from_string)
        })
    }

    fn execute_branch<'a>(
        &'a self,
        scope: &'a RunScope<'_>,
        start_id: String,
        mut inputs: StepInputs,
        mut previous: Option<NodeExecution>,
    ) -> BoxFuture<'a, Result<BranchOutcome, EngineError>> {
        async move {
            let mut node_id = start_id;
            let mut rolled_back: Option<BranchOutcome> = None;
            loop {
                let node = Self::node_of(scope, &node_id)?.clone();
                let exec = self
                    .execute_node(scope, &node, &inputs, previous.take())
                    .await?;

                if let Some(response) = exec.latest_response() {
                    inputs
                        .prior_outcomes
                        .insert(node.id.clone(), response.payload.clone());
                }

                match self.after_terminal(scope, &node, exec).await? {
                    NextMove::Goto(next) => node_id = next,
                    NextMove::Rollback { node_id: target, broken } => {
                        // The first failure that triggered rollback decides
                        // the branch outcome.
                        rolled_back.get_or_insert(broken);
                        node_id = target;
                    }
                    NextMove::RetrySame(id, prior) => {
                        node_id = id;
                        previous = Some(prior);
                    }
                    NextMove::Finish(outcome) => {
                        return Ok(rolled_back.unwrap_or(outcome));
                    }
                }
            }
        }
        .boxed()
    }

    /// Decides the branch walker's next move from a terminal record.
    async fn after_terminal(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        exec: NodeExecution,
    ) -> Result<NextMove, EngineError> {
        if exec.status.is_continuable() {
            return Ok(match node.next_id.clone() {
                Some(next) => NextMove::Goto(next),
                None => NextMove::Finish(BranchOutcome::ok()),
            });
        }

        let event = AdviseEvent {
            node_execution: &exec,
            status: exec.status,
            failure_info: exec.failure_info.as_ref(),
        };
        match advise(&node.advisers, &event) {
            Some(AdviserResponse::NextNode { node_id }) => {
                self.emit(EngineEvent::AdviceIssued {
                    plan_node_id: node.id.clone(),
                    advice: format!("next node {node_id}"),
                })
                .await;
                Ok(NextMove::Rollback {
                    node_id,
                    broken: BranchOutcome::broken(exec.status, exec.failure_info),
                })
            }
            Some(AdviserResponse::Retry { wait }) => {
                self.emit(EngineEvent::AdviceIssued {
                    plan_node_id: node.id.clone(),
                    advice: format!("retry after {wait:?}"),
                })
                .await;
                tokio::select! {
                    () = scope.cancellation.cancelled() => {
                        Ok(NextMove::Finish(BranchOutcome::broken(
                            NodeStatus::Aborted,
                            exec.failure_info.clone(),
                        )))
                    }
                    () = tokio::time::sleep(wait) => {
                        Ok(NextMove::RetrySame(node.id.clone(), exec))
                    }
                }
            }
            Some(AdviserResponse::IgnoreFailure) => {
                self.emit(EngineEvent::AdviceIssued {
                    plan_node_id: node.id.clone(),
                    advice: "ignore failure".to_string(),
                })
                .await;
                Ok(match node.next_id.clone() {
                    Some(next) => NextMove::Goto(next),
                    None => NextMove::Finish(BranchOutcome::ok()),
                })
            }
            Some(AdviserResponse::EndPlan) => {
                self.emit(EngineEvent::AdviceIssued {
                    plan_node_id: node.id.clone(),
                    advice: "end plan".to_string(),
                })
                .await;
                Ok(NextMove::Finish(BranchOutcome::broken(
                    exec.status,
                    exec.failure_info,
                )))
            }
            None => Ok(NextMove::Finish(BranchOutcome::broken(
                exec.status,
                exec.failure_info,
            ))),
        }
    }

    /// Drives one plan node to a terminal status and returns its record.
    async fn execute_node(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        inputs: &StepInputs,
        previous: Option<NodeExecution>,
    ) -> Result<NodeExecution, EngineError> {
        let exec = match previous {
            Some(prior) => NodeExecution::retry_of(&prior),
            None => NodeExecution::new(scope.run_id, node.id.clone()),
        };
        let exec_id = exec.id;
        self.retry_store(|| self.store.insert(exec.clone())).await?;
        self.emit(EngineEvent::NodeQueued {
            node_execution_id: exec_id,
            plan_node_id: node.id.clone(),
        })
        .await;

        if scope.cancellation.is_cancelled() {
            let aborted = self.mark_aborted(scope, exec_id, NodeStatus::Queued).await?;
            self.emit_terminal(node, &aborted).await;
            return Ok(aborted);
        }

        if node.skip_condition.evaluate(&scope.context) {
            let skipped = self
                .retry_store(|| {
                    self.store
                        .update_status(exec_id, NodeStatus::Queued, NodeStatus::Skipped)
                })
                .await?;
            self.emit_terminal(node, &skipped).await;
            return Ok(skipped);
        }

        self.retry_store(|| {
            self.store
                .update_status(exec_id, NodeStatus::Queued, NodeStatus::Running)
        })
        .await?;
        self.emit(EngineEvent::NodeStarted {
            node_execution_id: exec_id,
            plan_node_id: node.id.clone(),
        })
        .await;

        let facilitated = match node.facilitator_mode {
            FacilitatorMode::Sync => self.facilitate_sync(scope, node, inputs, exec_id).await?,
            FacilitatorMode::Async => self.facilitate_async(scope, node, inputs, exec_id).await?,
            FacilitatorMode::Child => {
                self.facilitate_children(scope, node, inputs, exec_id, false)
                    .await?
            }
            FacilitatorMode::ChildChain => {
                self.facilitate_children(scope, node, inputs, exec_id, true)
                    .await?
            }
        };

        let verdict = match facilitated {
            Facilitated::AlreadyTerminal(terminal) => {
                self.emit_terminal(node, &terminal).await;
                return Ok(terminal);
            }
            Facilitated::Verdict(verdict) => verdict,
        };

        // A node with a barrier arrives only after its own work succeeded;
        // a broken participant is withdrawn so its peers are not stuck.
        if let Some(identifier) = node.barrier_identifier.clone() {
            if verdict.status == NodeStatus::Succeeded {
                self.retry_store(|| {
                    self.store
                        .update_status(exec_id, NodeStatus::Running, NodeStatus::Waiting)
                })
                .await?;
                self.emit(EngineEvent::NodeWaiting {
                    node_execution_id: exec_id,
                    reason: format!("barrier {identifier}"),
                })
                .await;

                if let Some(aborted) =
                    self.await_barrier(scope, node, exec_id, &identifier).await?
                {
                    self.emit_terminal(node, &aborted).await;
                    return Ok(aborted);
                }
                self.retry_store(|| {
                    self.store
                        .update_status(exec_id, NodeStatus::Waiting, NodeStatus::Running)
                })
                .await?;
                self.emit(EngineEvent::NodeResumed {
                    node_execution_id: exec_id,
                })
                .await;
            } else {
                self.withdraw_from_barrier(scope, node, &identifier).await?;
            }
        }

        let terminal = self.settle(scope, node, exec_id, verdict).await?;
        self.emit_terminal(node, &terminal).await;
        Ok(terminal)
    }

    /// Persists a verdict: response payload, failure info, terminal status.
    async fn settle(
        &self,
        _scope: &RunScope<'_>,
        _node: &Arc<PlanNode>,
        exec_id: Uuid,
        verdict: StepVerdict,
    ) -> Result<NodeExecution, EngineError> {
        if !verdict.outcome.is_null() {
            let response = ExecutableResponse::new(verdict.outcome.clone());
            self.retry_store(|| self.store.record_response(exec_id, response.clone()))
                .await?;
        }
        if let Some(failure) = &verdict.failure {
            self.retry_store(|| self.store.set_failure(exec_id, failure.clone()))
                .await?;
        }
        self.retry_store(|| {
            self.store
                .update_status(exec_id, NodeStatus::Running, verdict.status)
        })
        .await
    }

    async fn facilitate_sync(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        inputs: &StepInputs,
        exec_id: Uuid,
    ) -> Result<Facilitated, EngineError> {
        let executor = self.steps.resolve(&node.step_type)?;
        if !executor.capabilities().sync {
            return Err(EngineError::CapabilityViolation {
                step_type: node.step_type.clone(),
                capability: "sync",
            });
        }

        let work = executor.execute_sync(&node.step_parameters, inputs);
        let bounded = async {
            match node.timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.ok(),
                None => Some(work.await),
            }
        };

        let outcome = tokio::select! {
            () = scope.cancellation.cancelled() => {
                let aborted = self.mark_aborted(scope, exec_id, NodeStatus::Running).await?;
                return Ok(Facilitated::AlreadyTerminal(aborted));
            }
            res = bounded => res,
        };

        match outcome {
            None => {
                // Per-node timeout elapsed in-process.
                let limit = node.timeout.unwrap_or_default();
                self.retry_store(|| {
                    self.store.set_failure(
                        exec_id,
                        FailureInfo::timeout(format!("step exceeded {limit:?}")),
                    )
                })
                .await?;
                self.retry_store(|| {
                    self.store.record_interrupt(
                        exec_id,
                        InterruptRecord::new(InterruptKind::Expire, "node timeout elapsed"),
                    )
                })
                .await?;
                let expired = self
                    .retry_store(|| {
                        self.store
                            .update_status(exec_id, NodeStatus::Running, NodeStatus::Expired)
                    })
                    .await?;
                Ok(Facilitated::AlreadyTerminal(expired))
            }
            Some(Ok(response)) => Ok(Facilitated::Verdict(StepVerdict::from(response))),
            Some(Err(err)) if err.is_fatal() => Err(err),
            Some(Err(err)) => Ok(Facilitated::Verdict(StepVerdict {
                status: NodeStatus::Failed,
                outcome: serde_json::Value::Null,
                failure: Some(FailureInfo::new(
                    err.to_string(),
                    FailureType::ApplicationError,
                )),
            })),
        }
    }

    async fn facilitate_async(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        inputs: &StepInputs,
        exec_id: Uuid,
    ) -> Result<Facilitated, EngineError> {
        let executor = self.steps.resolve(&node.step_type)?;
        if !executor.capabilities().async_dispatch {
            return Err(EngineError::CapabilityViolation {
                step_type: node.step_type.clone(),
                capability: "async",
            });
        }

        let task = match executor
            .execute_async(&node.step_parameters, inputs)
            .await
        {
            Ok(task) => match node.timeout {
                Some(limit) => task.with_timeout(limit),
                None => task,
            },
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                return Ok(Facilitated::Verdict(StepVerdict {
                    status: NodeStatus::Failed,
                    outcome: serde_json::Value::Null,
                    failure: Some(FailureInfo::new(
                        err.to_string(),
                        FailureType::ApplicationError,
                    )),
                }))
            }
        };

        // Park before dispatching so a fast callback cannot race the
        // Waiting transition.
        self.retry_store(|| {
            self.store
                .update_status(exec_id, NodeStatus::Running, NodeStatus::Waiting)
        })
        .await?;
        self.emit(EngineEvent::NodeWaiting {
            node_execution_id: exec_id,
            reason: format!("task {}", task.task_type),
        })
        .await;

        // Dispatch is guarded by an idempotent claim keyed on the execution
        // id: a re-driven node reuses the persisted callback id instead of
        // re-sending the task.
        let claim = IdempotentId::derive(&["dispatch", &exec_id.to_string()]);
        let acquisition =
            IdempotentLock::create(Arc::clone(&self.idempotency), claim, &self.config.dispatch_lock)
                .await?;

        let (callback_id, rx) = match acquisition {
            LockAcquisition::Acquired(mut lock) => {
                let (callback_id, rx) = retry_transient(&self.config.store_backoff, || {
                    self.correlator.dispatch(exec_id, &task)
                })
                .await?;
                let persisted = ExecutableResponse::new(serde_json::json!({
                    "callback_id": callback_id.as_str(),
                }));
                self.retry_store(|| self.store.record_response(exec_id, persisted.clone()))
                    .await?;
                lock.succeeded(serde_json::json!(callback_id.as_str()));
                (callback_id, rx)
            }
            LockAcquisition::AlreadyFinished(value) => {
                let callback_id = value
                    .as_str()
                    .map(CallbackId::from_string)
                    .ok_or_else(|| EngineError::CorruptPlan {
                        reason: "cached dispatch claim held no callback id".to_string(),
                    })?;
                let rx = self
                    .correlator
                    .register(callback_id.clone(), exec_id, task.timeout);
                (callback_id, rx)
            }
        };

        let response = tokio::select! {
            () = scope.cancellation.cancelled() => {
                let _ = self.correlator.abort(&callback_id).await;
                if executor.capabilities().abortable {
                    let _ = executor.handle_abort(&node.step_parameters, None).await;
                }
                let aborted = self.mark_aborted(scope, exec_id, NodeStatus::Waiting).await?;
                return Ok(Facilitated::AlreadyTerminal(aborted));
            }
            res = rx => res.unwrap_or_else(|_| {
                crate::dispatch::TaskResponse::failure(FailureInfo::new(
                    "callback dropped without a response",
                    FailureType::Connectivity,
                ))
            }),
        };

        self.retry_store(|| {
            self.store
                .update_status(exec_id, NodeStatus::Waiting, NodeStatus::Running)
        })
        .await?;
        self.emit(EngineEvent::NodeResumed {
            node_execution_id: exec_id,
        })
        .await;

        match executor
            .handle_async_response(&node.step_parameters, &response)
            .await
        {
            Ok(step_response) => Ok(Facilitated::Verdict(StepVerdict::from(step_response))),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(Facilitated::Verdict(StepVerdict {
                status: NodeStatus::Failed,
                outcome: serde_json::Value::Null,
                failure: Some(FailureInfo::new(
                    err.to_string(),
                    FailureType::ApplicationError,
                )),
            })),
        }
    }

    async fn facilitate_children(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        inputs: &StepInputs,
        exec_id: Uuid,
        sequential: bool,
    ) -> Result<Facilitated, EngineError> {
        self.retry_store(|| {
            self.store
                .update_status(exec_id, NodeStatus::Running, NodeStatus::Waiting)
        })
        .await?;
        self.emit(EngineEvent::NodeWaiting {
            node_execution_id: exec_id,
            reason: format!("{} child branches", node.child_ids.len()),
        })
        .await;

        let outcomes = if sequential {
            let mut outcomes = Vec::with_capacity(node.child_ids.len());
            for child in &node.child_ids {
                let outcome = self
                    .execute_branch(scope, child.clone(), inputs.clone(), None)
                    .await?;
                let broke = outcome.status != NodeStatus::Succeeded;
                outcomes.push(outcome);
                if broke {
                    break;
                }
            }
            outcomes
        } else {
            let branches = node
                .child_ids
                .iter()
                .map(|child| self.execute_branch(scope, child.clone(), inputs.clone(), None));
            try_join_all(branches).await?
        };

        if scope.cancellation.is_cancelled() {
            let aborted = self.mark_aborted(scope, exec_id, NodeStatus::Waiting).await?;
            return Ok(Facilitated::AlreadyTerminal(aborted));
        }

        self.retry_store(|| {
            self.store
                .update_status(exec_id, NodeStatus::Waiting, NodeStatus::Running)
        })
        .await?;
        self.emit(EngineEvent::NodeResumed {
            node_execution_id: exec_id,
        })
        .await;

        let reduced = Self::reduce(outcomes);
        if reduced.status == NodeStatus::Succeeded {
            Ok(Facilitated::Verdict(StepVerdict {
                status: NodeStatus::Succeeded,
                outcome: serde_json::json!({ "branches": node.child_ids.len() }),
                failure: None,
            }))
        } else {
            Ok(Facilitated::Verdict(StepVerdict {
                status: NodeStatus::Failed,
                outcome: serde_json::Value::Null,
                failure: reduced.failure.or_else(|| {
                    Some(FailureInfo::new(
                        "child branch broke",
                        FailureType::ApplicationError,
                    ))
                }),
            }))
        }
    }

    /// Parks a `Waiting` record at a barrier until it goes down.
    ///
    /// Returns `Some` with the aborted terminal record if the run was
    /// cancelled while parked; `None` when the barrier released the node.
    async fn await_barrier(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        exec_id: Uuid,
        identifier: &str,
    ) -> Result<Option<NodeExecution>, EngineError> {
        let group = scope.run_id.to_string();
        let expected = scope.plan.barrier_participants(identifier);
        let barrier = self
            .barriers
            .find_or_create(&group, identifier, expected)
            .await?;

        // Register before arriving so the flipping arrival cannot happen
        // between our arrival and our registration.
        let rx = self.barriers.register_waiter(barrier.id, exec_id);

        // Participant identity is the plan node id: re-arrival after a
        // restart stays idempotent.
        match self.barriers.arrive(barrier.id, &node.id).await? {
            ArrivalOutcome::Down => {
                self.emit(EngineEvent::BarrierDown {
                    identifier: identifier.to_string(),
                })
                .await;
            }
            ArrivalOutcome::AlreadyDown => {}
            ArrivalOutcome::Standing => {
                tokio::select! {
                    () = scope.cancellation.cancelled() => {
                        self.barriers.withdraw(barrier.id, &node.id).await?;
                        let aborted = self
                            .mark_aborted(scope, exec_id, NodeStatus::Waiting)
                            .await?;
                        return Ok(Some(aborted));
                    }
                    // A dropped sender also means the barrier was released.
                    _ = rx => {}
                }
            }
        }
        Ok(None)
    }

    async fn withdraw_from_barrier(
        &self,
        scope: &RunScope<'_>,
        node: &Arc<PlanNode>,
        identifier: &str,
    ) -> Result<(), EngineError> {
        let group = scope.run_id.to_string();
        if let Some(barrier) = self.barriers.find(&group, identifier).await? {
            warn!(
                barrier = identifier,
                plan_node = %node.id,
                "withdrawing broken participant from barrier"
            );
            self.barriers.withdraw(barrier.id, &node.id).await?;
        }
        Ok(())
    }

    async fn mark_aborted(
        &self,
        scope: &RunScope<'_>,
        exec_id: Uuid,
        from: NodeStatus,
    ) -> Result<NodeExecution, EngineError> {
        let reason = scope
            .cancellation
            .reason()
            .unwrap_or_else(|| "run aborted".to_string());
        self.retry_store(|| {
            self.store.record_interrupt(
                exec_id,
                InterruptRecord::new(InterruptKind::Abort, reason.clone()),
            )
        })
        .await?;
        self.retry_store(|| self.store.update_status(exec_id, from, NodeStatus::Aborted))
            .await
    }

    async fn build_report(
        &self,
        scope: &RunScope<'_>,
        outcome: BranchOutcome,
    ) -> Result<RunReport, EngineError> {
        let executions = self
            .retry_store(|| self.store.by_run(scope.run_id))
            .await?;
        self.emit(EngineEvent::RunFinished {
            run_id: scope.run_id,
            status: outcome.status,
        })
        .await;
        info!(
            run_id = %scope.run_id,
            status = %outcome.status,
            executions = executions.len(),
            "run finished"
        );
        Ok(RunReport {
            run_id: scope.run_id,
            plan_id: scope.plan.id(),
            status: outcome.status,
            failure_info: outcome.failure,
            executions,
        })
    }

    fn reduce(outcomes: Vec<BranchOutcome>) -> BranchOutcome {
        outcomes
            .into_iter()
            .find(|o| o.status != NodeStatus::Succeeded)
            .unwrap_or_else(BranchOutcome::ok)
    }

    fn node_of<'p>(
        scope: &'p RunScope<'_>,
        node_id: &str,
    ) -> Result<&'p Arc<PlanNode>, EngineError> {
        scope.plan.node(node_id).ok_or_else(|| EngineError::CorruptPlan {
            reason: format!("plan node {node_id} not found"),
        })
    }

    async fn retry_store<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        retry_transient(&self.config.store_backoff, op).await
    }

    async fn emit(&self, event: EngineEvent) {
        self.sink.emit(&event).await;
    }

    async fn emit_terminal(&self, node: &Arc<PlanNode>, exec: &NodeExecution) {
        self.emit(EngineEvent::NodeTerminal {
            node_execution_id: exec.id,
            plan_node_id: node.id.clone(),
            status: exec.status,
        })
        .await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::InMemoryBarrierStore;
    use crate::execution::InMemoryNodeExecutionStore;
    use crate::plan::{PlanBuilder, PlanNode, SkipCondition};
    use crate::testing::{MockRemoteChannel, MockStepExecutor};
    use pretty_assertions::assert_eq;

    fn engine_with(steps: Vec<Arc<MockStepExecutor>>) -> NodeExecutionEngine {
        let registry = StepRegistry::new();
        for step in steps {
            registry.register(step);
        }
        NodeExecutionEngine::new(
            Arc::new(InMemoryNodeExecutionStore::new()),
            Arc::new(BarrierCoordinator::new(Arc::new(InMemoryBarrierStore::new()))),
            TaskDispatchCorrelator::new(Arc::new(MockRemoteChannel::new())),
            Arc::new(registry),
        )
    }

    #[tokio::test]
    async fn test_linear_plan_succeeds() {
        let step = Arc::new(MockStepExecutor::sync("shell"));
        let engine = engine_with(vec![Arc::clone(&step)]);

        let plan = PlanBuilder::new()
            .node(PlanNode::builder("build", "shell").then("deploy").build())
            .node(PlanNode::builder("deploy", "shell").build())
            .start_at("build")
            .build()
            .unwrap();

        let report = engine.run(&plan, serde_json::json!({})).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.executions.len(), 2);
        assert_eq!(step.call_count(), 2);
        assert_eq!(
            report.execution_of("deploy").unwrap().status,
            NodeStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_skip_condition_skips_node() {
        let step = Arc::new(MockStepExecutor::sync("shell"));
        let engine = engine_with(vec![Arc::clone(&step)]);

        let plan = PlanBuilder::new()
            .node(
                PlanNode::builder("verify", "shell")
                    .with_skip_condition(SkipCondition::ContextEquals {
                        key: "dry_run".into(),
                        value: serde_json::json!(true),
                    })
                    .build(),
            )
            .start_at("verify")
            .build()
            .unwrap();

        let report = engine
            .run(&plan, serde_json::json!({"dry_run": true}))
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.execution_of("verify").unwrap().status,
            NodeStatus::Skipped
        );
        assert_eq!(step.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_step_type_is_fatal() {
        let engine = engine_with(vec![]);
        let plan = PlanBuilder::new()
            .node(PlanNode::builder("build", "ghost").build())
            .start_at("build")
            .build()
            .unwrap();

        let err = engine.run(&plan, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownStepType { .. }));
    }

    #[tokio::test]
    async fn test_sync_node_timeout_expires() {
        let step = Arc::new(
            MockStepExecutor::sync("slow").with_delay(Duration::from_millis(200)),
        );
        let engine = engine_with(vec![step]);

        let plan = PlanBuilder::new()
            .node(
                PlanNode::builder("slow-step", "slow")
                    .with_timeout(Duration::from_millis(20))
                    .build(),
            )
            .start_at("slow-step")
            .build()
            .unwrap();

        let report = engine.run(&plan, serde_json::json!({})).await.unwrap();
        let exec = report.execution_of("slow-step").unwrap();
        assert_eq!(exec.status, NodeStatus::Expired);
        assert!(exec
            .failure_info
            .as_ref()
            .is_some_and(|f| f.failure_types.contains(&FailureType::Timeout)));
        assert_eq!(exec.interrupt_history.len(), 1);
        assert_eq!(exec.interrupt_history[0].kind, InterruptKind::Expire);
    }

    #[tokio::test]
    async fn test_abort_run_for_unknown_run_returns_false() {
        let engine = engine_with(vec![]);
        assert!(!engine.abort_run(Uuid::new_v4(), "nothing there"));
    }

    #[tokio::test]
    async fn test_config_builders() {
        let config = EngineConfig::new()
            .with_resume_callback_timeout(Duration::from_secs(30))
            .with_store_backoff(BackoffPolicy::new().with_max_attempts(1));
        assert_eq!(config.resume_callback_timeout, Duration::from_secs(30));
        assert_eq!(config.store_backoff.max_attempts, 1);
    }
}
