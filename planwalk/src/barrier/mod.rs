//! Distributed rendezvous for parallel branches.
//!
//! A barrier is keyed by (group id, identifier) and starts `Standing`. Each
//! participant records its arrival; the arrival that satisfies the expected
//! count flips the barrier `Standing -> Down` exactly once, guarded by a
//! compare-and-swap against the store rather than read-then-write, so
//! concurrent arrivals cannot double-transition. Waiters parked on the
//! barrier are woken when it goes down.
//!
//! A participant that aborts before arriving must be withdrawn, which
//! recomputes the expectation; otherwise the barrier can never go down.
//! Barriers standing beyond a deadline are listed for operational alerting
//! rather than hanging silently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::EngineError;

/// State of a barrier instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    /// Waiting for participants.
    Standing,
    /// All expected participants arrived; waiters released.
    Down,
}

/// One participant's standing at a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierPosition {
    /// The participant id (typically a node execution id).
    pub participant_id: String,
    /// Whether the participant has arrived.
    pub arrived: bool,
}

/// One named barrier instance shared by the parallel branches of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierInstance {
    /// Unique instance id.
    pub id: Uuid,
    /// The scope the barrier belongs to (typically the run id).
    pub group_id: String,
    /// The barrier name within the group.
    pub identifier: String,
    /// Current state; transitions `Standing -> Down` exactly once.
    pub state: BarrierState,
    /// Number of participants expected to arrive.
    pub expected: usize,
    /// Recorded participants.
    pub positions: Vec<BarrierPosition>,
    /// When the first participant created the instance.
    pub created_at: DateTime<Utc>,
}

impl BarrierInstance {
    /// Creates a standing barrier expecting `expected` participants.
    #[must_use]
    pub fn new(
        group_id: impl Into<String>,
        identifier: impl Into<String>,
        expected: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            identifier: identifier.into(),
            state: BarrierState::Standing,
            expected,
            positions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Number of participants that have arrived.
    #[must_use]
    pub fn arrived_count(&self) -> usize {
        self.positions.iter().filter(|p| p.arrived).count()
    }
}

/// Outcome of an arrival, as observed by the arriving participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// The barrier is still standing; the participant must wait.
    Standing,
    /// This arrival flipped the barrier down.
    Down,
    /// The barrier was already down; the arrival is a no-op.
    AlreadyDown,
}

/// Storage boundary for barrier instances.
///
/// Every mutation is a single-document atomic update; the coordinator
/// never does read-then-write against this trait.
#[async_trait]
pub trait BarrierStore: Send + Sync {
    /// Finds a barrier by group and identifier.
    async fn find(
        &self,
        group_id: &str,
        identifier: &str,
    ) -> Result<Option<BarrierInstance>, EngineError>;

    /// Inserts the instance unless one already exists for its key; returns
    /// the stored instance either way.
    async fn insert_if_absent(
        &self,
        instance: BarrierInstance,
    ) -> Result<BarrierInstance, EngineError>;

    /// Atomically records a participant's arrival and returns the updated
    /// snapshot. Idempotent per participant. A down barrier is returned
    /// unchanged.
    async fn record_arrival(
        &self,
        barrier_id: Uuid,
        participant_id: &str,
    ) -> Result<BarrierInstance, EngineError>;

    /// Compare-and-swap on the barrier state. Returns true if this call
    /// performed the swap.
    async fn compare_and_set_state(
        &self,
        barrier_id: Uuid,
        expected: BarrierState,
        new: BarrierState,
    ) -> Result<bool, EngineError>;

    /// Atomically removes a participant and decrements the expectation;
    /// returns the updated snapshot.
    async fn remove_participant(
        &self,
        barrier_id: Uuid,
        participant_id: &str,
    ) -> Result<BarrierInstance, EngineError>;

    /// Deletes a barrier instance.
    async fn delete(&self, barrier_id: Uuid) -> Result<(), EngineError>;

    /// Lists standing barriers older than `age`.
    async fn standing_older_than(
        &self,
        age: Duration,
    ) -> Result<Vec<BarrierInstance>, EngineError>;
}

/// In-memory barrier store.
#[derive(Debug, Default)]
pub struct InMemoryBarrierStore {
    inner: Mutex<BarrierMap>,
}

#[derive(Debug, Default)]
struct BarrierMap {
    by_id: HashMap<Uuid, BarrierInstance>,
    by_key: HashMap<(String, String), Uuid>,
}

impl InMemoryBarrierStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BarrierStore for InMemoryBarrierStore {
    async fn find(
        &self,
        group_id: &str,
        identifier: &str,
    ) -> Result<Option<BarrierInstance>, EngineError> {
        let inner = self.inner.lock();
        Ok(inner
            .by_key
            .get(&(group_id.to_string(), identifier.to_string()))
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        instance: BarrierInstance,
    ) -> Result<BarrierInstance, EngineError> {
        let mut inner = self.inner.lock();
        let key = (instance.group_id.clone(), instance.identifier.clone());
        if let Some(existing) = inner.by_key.get(&key).and_then(|id| inner.by_id.get(id)) {
            return Ok(existing.clone());
        }
        inner.by_key.insert(key, instance.id);
        inner.by_id.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn record_arrival(
        &self,
        barrier_id: Uuid,
        participant_id: &str,
    ) -> Result<BarrierInstance, EngineError> {
        let mut inner = self.inner.lock();
        let barrier = inner
            .by_id
            .get_mut(&barrier_id)
            .ok_or(EngineError::BarrierNotFound(barrier_id))?;

        if barrier.state == BarrierState::Down {
            return Ok(barrier.clone());
        }

        match barrier
            .positions
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
        {
            Some(position) => position.arrived = true,
            None => barrier.positions.push(BarrierPosition {
                participant_id: participant_id.to_string(),
                arrived: true,
            }),
        }
        Ok(barrier.clone())
    }

    async fn compare_and_set_state(
        &self,
        barrier_id: Uuid,
        expected: BarrierState,
        new: BarrierState,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock();
        let barrier = inner
            .by_id
            .get_mut(&barrier_id)
            .ok_or(EngineError::BarrierNotFound(barrier_id))?;
        if barrier.state != expected {
            return Ok(false);
        }
        barrier.state = new;
        Ok(true)
    }

    async fn remove_participant(
        &self,
        barrier_id: Uuid,
        participant_id: &str,
    ) -> Result<BarrierInstance, EngineError> {
        let mut inner = self.inner.lock();
        let barrier = inner
            .by_id
            .get_mut(&barrier_id)
            .ok_or(EngineError::BarrierNotFound(barrier_id))?;
        barrier
            .positions
            .retain(|p| p.participant_id != participant_id);
        barrier.expected = barrier.expected.saturating_sub(1);
        Ok(barrier.clone())
    }

    async fn delete(&self, barrier_id: Uuid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(barrier) = inner.by_id.remove(&barrier_id) {
            inner
                .by_key
                .remove(&(barrier.group_id, barrier.identifier));
        }
        Ok(())
    }

    async fn standing_older_than(
        &self,
        age: Duration,
    ) -> Result<Vec<BarrierInstance>, EngineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let inner = self.inner.lock();
        Ok(inner
            .by_id
            .values()
            .filter(|b| b.state == BarrierState::Standing && b.created_at < cutoff)
            .cloned()
            .collect())
    }
}

struct Waiter {
    node_execution_id: Uuid,
    tx: oneshot::Sender<()>,
}

/// Coordinates barrier arrivals and parks/wakes waiting branches.
pub struct BarrierCoordinator {
    store: Arc<dyn BarrierStore>,
    waiters: Mutex<HashMap<Uuid, Vec<Waiter>>>,
}

impl BarrierCoordinator {
    /// Creates a coordinator over a barrier store.
    #[must_use]
    pub fn new(store: Arc<dyn BarrierStore>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Finds the barrier for (group, identifier), creating a standing
    /// instance expecting `expected_participants` if none exists.
    pub async fn find_or_create(
        &self,
        group_id: &str,
        identifier: &str,
        expected_participants: usize,
    ) -> Result<BarrierInstance, EngineError> {
        if let Some(existing) = self.store.find(group_id, identifier).await? {
            return Ok(existing);
        }
        self.store
            .insert_if_absent(BarrierInstance::new(group_id, identifier, expected_participants))
            .await
    }

    /// Finds the barrier for (group, identifier), if one exists.
    pub async fn find(
        &self,
        group_id: &str,
        identifier: &str,
    ) -> Result<Option<BarrierInstance>, EngineError> {
        self.store.find(group_id, identifier).await
    }

    /// Registers a waiter to be woken when the barrier goes down.
    ///
    /// Register *before* arriving: registration ahead of the arrival count
    /// means a concurrent flip can never miss the waiter. If the barrier is
    /// already down by the time the caller arrives, the stale entry is
    /// drained harmlessly.
    pub fn register_waiter(&self, barrier_id: Uuid, node_execution_id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .entry(barrier_id)
            .or_default()
            .push(Waiter {
                node_execution_id,
                tx,
            });
        rx
    }

    /// Records a participant's arrival.
    ///
    /// Exactly one arrival observes [`ArrivalOutcome::Down`]: the one whose
    /// compare-and-swap flipped the state. Earlier arrivals observe
    /// `Standing`; later ones observe `AlreadyDown` and are no-ops.
    pub async fn arrive(
        &self,
        barrier_id: Uuid,
        participant_id: &str,
    ) -> Result<ArrivalOutcome, EngineError> {
        let snapshot = self.store.record_arrival(barrier_id, participant_id).await?;

        if snapshot.state == BarrierState::Down {
            warn!(
                barrier = %snapshot.identifier,
                participant = participant_id,
                "late arrival at a barrier that is already down"
            );
            // Drain any entries registered ahead of this arrival so a down
            // barrier never accumulates waiters.
            self.release_waiters(barrier_id);
            return Ok(ArrivalOutcome::AlreadyDown);
        }

        if snapshot.arrived_count() >= snapshot.expected {
            if self
                .store
                .compare_and_set_state(barrier_id, BarrierState::Standing, BarrierState::Down)
                .await?
            {
                let released = self.release_waiters(barrier_id);
                info!(
                    barrier = %snapshot.identifier,
                    participants = snapshot.expected,
                    released = released.len(),
                    "barrier went down"
                );
                return Ok(ArrivalOutcome::Down);
            }
            // Lost the swap to a concurrent arrival.
            self.release_waiters(barrier_id);
            return Ok(ArrivalOutcome::AlreadyDown);
        }

        Ok(ArrivalOutcome::Standing)
    }

    /// Withdraws an aborted participant and recomputes the expectation.
    ///
    /// If the remaining arrivals already satisfy the reduced expectation
    /// the withdrawal itself takes the barrier down; a withdrawal that
    /// empties the barrier deletes it.
    pub async fn withdraw(
        &self,
        barrier_id: Uuid,
        participant_id: &str,
    ) -> Result<(), EngineError> {
        let snapshot = self.store.remove_participant(barrier_id, participant_id).await?;

        if snapshot.expected == 0 {
            self.store.delete(barrier_id).await?;
            self.release_waiters(barrier_id);
            return Ok(());
        }

        if snapshot.state == BarrierState::Standing
            && snapshot.arrived_count() >= snapshot.expected
            && self
                .store
                .compare_and_set_state(barrier_id, BarrierState::Standing, BarrierState::Down)
                .await?
        {
            let released = self.release_waiters(barrier_id);
            info!(
                barrier = %snapshot.identifier,
                released = released.len(),
                "barrier went down after participant withdrawal"
            );
        }
        Ok(())
    }

    /// Lists standing barriers older than `age` for operational alerting.
    pub async fn standing_longer_than(
        &self,
        age: Duration,
    ) -> Result<Vec<BarrierInstance>, EngineError> {
        self.store.standing_older_than(age).await
    }

    fn release_waiters(&self, barrier_id: Uuid) -> Vec<Uuid> {
        let waiters = self.waiters.lock().remove(&barrier_id).unwrap_or_default();
        let mut released = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            released.push(waiter.node_execution_id);
            // A dropped receiver means the branch stopped waiting; ignore.
            let _ = waiter.tx.send(());
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn coordinator() -> BarrierCoordinator {
        BarrierCoordinator::new(Arc::new(InMemoryBarrierStore::new()))
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let coordinator = coordinator();
        let first = coordinator.find_or_create("run-1", "sync1", 2).await.unwrap();
        let second = coordinator.find_or_create("run-1", "sync1", 2).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.state, BarrierState::Standing);
    }

    #[tokio::test]
    async fn test_kth_arrival_flips_exactly_once() {
        let coordinator = coordinator();
        let barrier = coordinator.find_or_create("run-1", "sync1", 3).await.unwrap();

        assert_eq!(
            coordinator.arrive(barrier.id, "a").await.unwrap(),
            ArrivalOutcome::Standing
        );
        assert_eq!(
            coordinator.arrive(barrier.id, "b").await.unwrap(),
            ArrivalOutcome::Standing
        );
        assert_eq!(
            coordinator.arrive(barrier.id, "c").await.unwrap(),
            ArrivalOutcome::Down
        );
        // A late arrival is a no-op.
        assert_eq!(
            coordinator.arrive(barrier.id, "d").await.unwrap(),
            ArrivalOutcome::AlreadyDown
        );
    }

    #[tokio::test]
    async fn test_single_participant_fast_path() {
        let coordinator = coordinator();
        let barrier = coordinator.find_or_create("run-1", "solo", 1).await.unwrap();
        let outcome = coordinator.arrive(barrier.id, "only").await.unwrap();
        assert_eq!(outcome, ArrivalOutcome::Down);
    }

    #[tokio::test]
    async fn test_repeat_arrival_is_idempotent_per_participant() {
        let coordinator = coordinator();
        let barrier = coordinator.find_or_create("run-1", "sync1", 2).await.unwrap();

        assert_eq!(
            coordinator.arrive(barrier.id, "a").await.unwrap(),
            ArrivalOutcome::Standing
        );
        // Re-driving the same participant must not satisfy the barrier.
        assert_eq!(
            coordinator.arrive(barrier.id, "a").await.unwrap(),
            ArrivalOutcome::Standing
        );
        assert_eq!(
            coordinator.arrive(barrier.id, "b").await.unwrap(),
            ArrivalOutcome::Down
        );
    }

    #[tokio::test]
    async fn test_waiters_released_when_barrier_goes_down() {
        let coordinator = coordinator();
        let barrier = coordinator.find_or_create("run-1", "sync1", 2).await.unwrap();

        let waiter = coordinator.register_waiter(barrier.id, Uuid::new_v4());
        coordinator.arrive(barrier.id, "a").await.unwrap();
        coordinator.arrive(barrier.id, "b").await.unwrap();

        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_withdrawal_releases_stuck_barrier() {
        let coordinator = coordinator();
        let barrier = coordinator.find_or_create("run-1", "sync1", 3).await.unwrap();

        coordinator.arrive(barrier.id, "a").await.unwrap();
        coordinator.arrive(barrier.id, "b").await.unwrap();

        let waiter = coordinator.register_waiter(barrier.id, Uuid::new_v4());
        // The third participant aborts before arriving; withdrawing it
        // recomputes the expectation and takes the barrier down.
        coordinator.withdraw(barrier.id, "c").await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_arrival_drains_stale_waiter_entries() {
        let coordinator = coordinator();
        let barrier = coordinator.find_or_create("run-1", "solo", 1).await.unwrap();
        assert_eq!(
            coordinator.arrive(barrier.id, "only").await.unwrap(),
            ArrivalOutcome::Down
        );

        // A re-driven participant registers before arriving, then finds the
        // barrier already down; its entry must not outlive the arrival.
        let _rx = coordinator.register_waiter(barrier.id, Uuid::new_v4());
        assert_eq!(
            coordinator.arrive(barrier.id, "only").await.unwrap(),
            ArrivalOutcome::AlreadyDown
        );
        assert_eq!(coordinator.waiters.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_standing_longer_than_lists_stuck_barriers() {
        let coordinator = coordinator();
        coordinator.find_or_create("run-1", "stuck", 2).await.unwrap();

        let stuck = coordinator
            .standing_longer_than(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].identifier, "stuck");
    }
}
