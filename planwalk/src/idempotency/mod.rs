//! Idempotent-operation registry and scoped lock.
//!
//! Any operation that must not be double-executed across retries (for
//! example a delegate task resend after a network blip re-triggering a
//! cloud resource creation) registers under an opaque operation id. The
//! registry guarantees at-most-one concurrent execution per id and, once a
//! holder reports success, durably reusable results for later retries of
//! the same id.
//!
//! The registry is an explicitly constructed, injected cache with a
//! documented eviction policy: finished entries are evicted oldest-first
//! when capacity is exceeded and expire after the configured TTL; tentative
//! entries are never evicted while a holder is working.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::EngineError;

/// Opaque, caller-supplied correlation key for a non-idempotent operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotentId(String);

impl IdempotentId {
    /// Wraps a caller-supplied key.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an id by hashing operation/target components.
    #[must_use]
    pub fn derive(components: &[&str]) -> Self {
        let combined = components.join(":");
        let mut hasher = Sha256::new();
        hasher.update(combined.as_bytes());
        let digest = hasher.finalize();
        Self(format!("idem:{}", hex::encode(&digest[..16])))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// A holder claimed the id and is doing the work.
    Tentative,
    /// A holder is working and at least one other party asked meanwhile.
    TentativeAlready,
    /// The work finished; the cached result is reusable.
    Finished,
}

#[derive(Debug, Clone)]
struct Record {
    state: RecordState,
    result: Option<serde_json::Value>,
    finished_at: Option<Instant>,
}

/// Outcome of a [`IdempotencyRegistry::register`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// No record existed; the caller must do the work.
    New,
    /// Another party is doing the work; poll again.
    Running,
    /// The work already finished; reuse the cached result.
    Done(serde_json::Value),
}

/// Eviction configuration for the registry cache.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of finished entries retained.
    pub capacity: usize,
    /// Time-to-live for finished entries; `None` keeps them until evicted
    /// by capacity.
    pub ttl: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Some(Duration::from_secs(3600)),
        }
    }
}

impl RegistryConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the finished-entry capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the finished-entry TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<IdempotentId, Record>,
    finish_order: VecDeque<IdempotentId>,
}

/// Tracks in-flight and completed non-idempotent operations.
#[derive(Debug)]
pub struct IdempotencyRegistry {
    inner: Mutex<RegistryInner>,
    config: RegistryConfig,
}

impl Default for IdempotencyRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl IdempotencyRegistry {
    /// Creates a registry with the given eviction policy.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            config,
        }
    }

    /// Registers intent to execute the operation, atomically.
    ///
    /// - no record: a `Tentative` claim is created and `New` returned
    /// - record tentative: `Running` is returned and the record marked
    ///   `TentativeAlready` to signal contention
    /// - record finished: `Done` with the cached result
    pub fn register(&self, id: &IdempotentId) -> Registration {
        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner);

        match inner.records.get_mut(id) {
            None => {
                inner.records.insert(
                    id.clone(),
                    Record {
                        state: RecordState::Tentative,
                        result: None,
                        finished_at: None,
                    },
                );
                Registration::New
            }
            Some(record) => match record.state {
                RecordState::Tentative | RecordState::TentativeAlready => {
                    record.state = RecordState::TentativeAlready;
                    Registration::Running
                }
                RecordState::Finished => Registration::Done(
                    record.result.clone().unwrap_or(serde_json::Value::Null),
                ),
            },
        }
    }

    /// Promotes the record to `Finished` with its cached result.
    pub fn finish(&self, id: &IdempotentId, result: serde_json::Value) {
        let mut inner = self.inner.lock();
        inner.records.insert(
            id.clone(),
            Record {
                state: RecordState::Finished,
                result: Some(result),
                finished_at: Some(Instant::now()),
            },
        );
        inner.finish_order.push_back(id.clone());
        self.evict_over_capacity(&mut inner);
    }

    /// Removes the record so a future caller retries from scratch.
    pub fn unregister(&self, id: &IdempotentId) {
        self.inner.lock().records.remove(id);
    }

    /// Returns the current state of a record, if present.
    #[must_use]
    pub fn state(&self, id: &IdempotentId) -> Option<RecordState> {
        self.inner.lock().records.get(id).map(|r| r.state)
    }

    /// Returns the number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    fn purge_expired(&self, inner: &mut RegistryInner) {
        let Some(ttl) = self.config.ttl else { return };
        inner.records.retain(|_, record| {
            record
                .finished_at
                .map_or(true, |finished| finished.elapsed() < ttl)
        });
        let records = &inner.records;
        inner.finish_order.retain(|id| records.contains_key(id));
    }

    fn evict_over_capacity(&self, inner: &mut RegistryInner) {
        while inner.finish_order.len() > self.config.capacity {
            let Some(oldest) = inner.finish_order.pop_front() else {
                break;
            };
            // Only finished entries sit in the order queue; tentative
            // claims are never evicted out from under a working holder.
            if inner
                .records
                .get(&oldest)
                .is_some_and(|r| r.state == RecordState::Finished)
            {
                inner.records.remove(&oldest);
            }
        }
    }
}

/// Acquisition configuration for [`IdempotentLock::create`].
#[derive(Debug, Clone)]
pub struct IdempotentLockConfig {
    /// Total time to keep polling before giving up.
    pub timeout: Duration,
    /// Interval between registration attempts.
    pub poll_interval: Duration,
}

impl Default for IdempotentLockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl IdempotentLockConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total acquisition timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Outcome of acquiring an idempotent lock.
#[derive(Debug)]
pub enum LockAcquisition {
    /// The caller holds the claim and must do the work.
    Acquired(IdempotentLock),
    /// The work already finished; reuse the cached result.
    AlreadyFinished(serde_json::Value),
}

/// Scoped claim over an idempotent operation id.
///
/// On every exit path the claim is released: if [`succeeded`] was called
/// the result is persisted as finished, otherwise the record is
/// unregistered so a future caller can retry the same id from scratch.
///
/// [`succeeded`]: IdempotentLock::succeeded
#[derive(Debug)]
pub struct IdempotentLock {
    registry: Arc<IdempotencyRegistry>,
    id: IdempotentId,
    result: Option<serde_json::Value>,
}

impl IdempotentLock {
    /// Acquires the lock, polling while another party holds the claim.
    ///
    /// Polling is bounded by `config.timeout`; on expiry the distinct
    /// [`EngineError::IdempotentLockTimeout`] is raised. Dropping the
    /// returned future cancels the acquisition cleanly.
    pub async fn create(
        registry: Arc<IdempotencyRegistry>,
        id: IdempotentId,
        config: &IdempotentLockConfig,
    ) -> Result<LockAcquisition, EngineError> {
        let deadline = Instant::now() + config.timeout;
        loop {
            match registry.register(&id) {
                Registration::New => {
                    return Ok(LockAcquisition::Acquired(Self {
                        registry,
                        id,
                        result: None,
                    }));
                }
                Registration::Done(result) => {
                    return Ok(LockAcquisition::AlreadyFinished(result));
                }
                Registration::Running => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EngineError::IdempotentLockTimeout {
                            id: id.as_str().to_string(),
                            timeout: config.timeout,
                        });
                    }
                    let remaining = deadline - now;
                    tokio::time::sleep(config.poll_interval.min(remaining)).await;
                }
            }
        }
    }

    /// Records the operation's result; persisted as finished on release.
    pub fn succeeded(&mut self, result: serde_json::Value) {
        self.result = Some(result);
    }

    /// Returns the operation id this lock claims.
    #[must_use]
    pub fn id(&self) -> &IdempotentId {
        &self.id
    }
}

impl Drop for IdempotentLock {
    fn drop(&mut self) {
        match self.result.take() {
            Some(result) => self.registry.finish(&self.id, result),
            None => self.registry.unregister(&self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_derive_is_stable() {
        let a = IdempotentId::derive(&["create-vm", "account-1", "vm-42"]);
        let b = IdempotentId::derive(&["create-vm", "account-1", "vm-42"]);
        let c = IdempotentId::derive(&["create-vm", "account-1", "vm-43"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("idem:"));
    }

    #[test]
    fn test_register_lifecycle() {
        let registry = IdempotencyRegistry::default();
        let id = IdempotentId::new("op-1");

        assert_eq!(registry.register(&id), Registration::New);
        assert_eq!(registry.register(&id), Registration::Running);
        assert_eq!(registry.state(&id), Some(RecordState::TentativeAlready));

        registry.finish(&id, serde_json::json!({"vm": "i-123"}));
        assert_eq!(
            registry.register(&id),
            Registration::Done(serde_json::json!({"vm": "i-123"}))
        );
    }

    #[test]
    fn test_unregister_allows_fresh_claim() {
        let registry = IdempotencyRegistry::default();
        let id = IdempotentId::new("op-1");

        assert_eq!(registry.register(&id), Registration::New);
        registry.unregister(&id);
        assert_eq!(registry.register(&id), Registration::New);
    }

    #[test]
    fn test_concurrent_registers_yield_exactly_one_new() {
        let registry = Arc::new(IdempotencyRegistry::default());
        let id = IdempotentId::new("contested");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                std::thread::spawn(move || registry.register(&id))
            })
            .collect();

        let outcomes: Vec<Registration> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let new_count = outcomes
            .iter()
            .filter(|o| matches!(o, Registration::New))
            .count();
        assert_eq!(new_count, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Registration::Running))
                .count(),
            15
        );
    }

    #[test]
    fn test_capacity_evicts_oldest_finished() {
        let registry = IdempotencyRegistry::new(RegistryConfig::new().with_capacity(2));
        for i in 0..4 {
            let id = IdempotentId::new(format!("op-{i}"));
            registry.register(&id);
            registry.finish(&id, serde_json::json!(i));
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(&IdempotentId::new("op-0")), None);
        assert_eq!(
            registry.state(&IdempotentId::new("op-3")),
            Some(RecordState::Finished)
        );
    }

    #[test]
    fn test_ttl_expires_finished_entries() {
        let registry =
            IdempotencyRegistry::new(RegistryConfig::new().with_ttl(Duration::ZERO));
        let id = IdempotentId::new("op-1");
        registry.register(&id);
        registry.finish(&id, serde_json::json!("done"));

        // Expired on the next registration pass, so the caller is NEW again.
        assert_eq!(registry.register(&id), Registration::New);
    }

    #[tokio::test]
    async fn test_lock_release_without_success_reverts() {
        let registry = Arc::new(IdempotencyRegistry::default());
        let id = IdempotentId::new("op-1");
        let config = IdempotentLockConfig::default();

        let acquisition = IdempotentLock::create(Arc::clone(&registry), id.clone(), &config)
            .await
            .unwrap();
        assert!(matches!(acquisition, LockAcquisition::Acquired(_)));
        drop(acquisition);

        // Released without success: a future caller starts from scratch.
        assert_eq!(registry.register(&id), Registration::New);
    }

    #[tokio::test]
    async fn test_lock_success_caches_result_for_retries() {
        let registry = Arc::new(IdempotencyRegistry::default());
        let id = IdempotentId::new("op-1");
        let config = IdempotentLockConfig::default();

        match IdempotentLock::create(Arc::clone(&registry), id.clone(), &config)
            .await
            .unwrap()
        {
            LockAcquisition::Acquired(mut lock) => {
                lock.succeeded(serde_json::json!({"resource": "created"}));
            }
            LockAcquisition::AlreadyFinished(_) => panic!("expected fresh claim"),
        }

        match IdempotentLock::create(Arc::clone(&registry), id, &config)
            .await
            .unwrap()
        {
            LockAcquisition::AlreadyFinished(result) => {
                assert_eq!(result, serde_json::json!({"resource": "created"}));
            }
            LockAcquisition::Acquired(_) => panic!("work must not be redone"),
        }
    }

    #[tokio::test]
    async fn test_lock_acquisition_times_out_while_held() {
        let registry = Arc::new(IdempotencyRegistry::default());
        let id = IdempotentId::new("op-1");
        let config = IdempotentLockConfig::new()
            .with_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));

        let holder = IdempotentLock::create(Arc::clone(&registry), id.clone(), &config)
            .await
            .unwrap();
        assert!(matches!(holder, LockAcquisition::Acquired(_)));

        let err = IdempotentLock::create(Arc::clone(&registry), id, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdempotentLockTimeout { .. }));
        drop(holder);
    }

    #[tokio::test]
    async fn test_waiter_sees_result_after_holder_succeeds() {
        let registry = Arc::new(IdempotencyRegistry::default());
        let id = IdempotentId::new("op-1");
        let config = IdempotentLockConfig::new()
            .with_timeout(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(5));

        let holder_registry = Arc::clone(&registry);
        let holder_id = id.clone();
        let holder_config = config.clone();
        let holder = tokio::spawn(async move {
            match IdempotentLock::create(holder_registry, holder_id, &holder_config)
                .await
                .unwrap()
            {
                LockAcquisition::Acquired(mut lock) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    lock.succeeded(serde_json::json!("result"));
                }
                LockAcquisition::AlreadyFinished(_) => panic!("holder should be first"),
            }
        });

        // Give the holder a head start, then contend.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = IdempotentLock::create(Arc::clone(&registry), id, &config)
            .await
            .unwrap();
        holder.await.unwrap();

        match waiter {
            LockAcquisition::AlreadyFinished(result) => {
                assert_eq!(result, serde_json::json!("result"));
            }
            LockAcquisition::Acquired(_) => panic!("waiter must reuse the cached result"),
        }
    }
}
