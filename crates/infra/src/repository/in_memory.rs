use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use sagaflow_core::{CorrelationId, ExpectedVersion, SagaData, SagaInstance, SagaQuery};

use super::r#trait::{ConcurrencyMode, InsertOutcome, InstanceLock, RepositoryError, SagaRepository};

/// Correlation ids currently held by a dispatch.
#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<CorrelationId>>,
    released: Condvar,
}

impl LockTable {
    fn acquire(&self, correlation_id: CorrelationId, timeout: Duration) -> Result<(), RepositoryError> {
        let started = Instant::now();
        let mut held = self.held.lock().map_err(|_| poisoned())?;

        while held.contains(&correlation_id) {
            let waited = started.elapsed();
            let Some(remaining) = timeout.checked_sub(waited).filter(|d| !d.is_zero()) else {
                return Err(RepositoryError::LockTimeout { correlation_id, waited });
            };
            held = self
                .released
                .wait_timeout(held, remaining)
                .map_err(|_| poisoned())?
                .0;
        }

        held.insert(correlation_id);
        Ok(())
    }

    fn release(&self, correlation_id: CorrelationId) {
        // A poisoned table still has to let the id go.
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&correlation_id);
        drop(held);
        self.released.notify_all();
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Storage("lock poisoned".to_string())
}

/// In-memory saga repository.
///
/// Intended for tests/dev. Instances are kept in a map keyed by correlation
/// id, so `query` results come back in ascending id order.
#[derive(Debug)]
pub struct InMemorySagaRepository<D> {
    instances: RwLock<BTreeMap<CorrelationId, SagaInstance<D>>>,
    mode: ConcurrencyMode,
    locks: Arc<LockTable>,
}

impl<D> Default for InMemorySagaRepository<D> {
    fn default() -> Self {
        Self::with_mode(ConcurrencyMode::Optimistic)
    }
}

impl<D> InMemorySagaRepository<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pessimistic(lock_timeout: Duration) -> Self {
        Self::with_mode(ConcurrencyMode::Pessimistic { lock_timeout })
    }

    pub fn with_mode(mode: ConcurrencyMode) -> Self {
        Self {
            instances: RwLock::new(BTreeMap::new()),
            mode,
            locks: Arc::new(LockTable::default()),
        }
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.instances.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Clone> InMemorySagaRepository<D> {
    /// Snapshot of the stored instance, bypassing locks.
    pub fn get(&self, correlation_id: CorrelationId) -> Option<SagaInstance<D>> {
        self.instances.read().ok()?.get(&correlation_id).cloned()
    }
}

impl<D: SagaData> SagaRepository<D> for InMemorySagaRepository<D> {
    fn acquire(&self, correlation_id: CorrelationId) -> Result<InstanceLock, RepositoryError> {
        let ConcurrencyMode::Pessimistic { lock_timeout } = self.mode else {
            return Ok(InstanceLock::unlocked(correlation_id));
        };

        if let Err(err) = self.locks.acquire(correlation_id, lock_timeout) {
            warn!(correlation_id = %correlation_id, error = %err, "instance lock not acquired");
            return Err(err);
        }
        let locks = Arc::clone(&self.locks);
        Ok(InstanceLock::exclusive(correlation_id, move || locks.release(correlation_id)))
    }

    fn load(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance<D>>, RepositoryError> {
        let instances = self.instances.read().map_err(|_| poisoned())?;
        Ok(instances.get(&correlation_id).cloned())
    }

    fn insert(&self, instance: &mut SagaInstance<D>) -> Result<InsertOutcome, RepositoryError> {
        let correlation_id = instance.correlation_id();
        let mut instances = self.instances.write().map_err(|_| poisoned())?;
        if instances.contains_key(&correlation_id) {
            debug!(correlation_id = %correlation_id, "insert lost to an existing instance");
            return Ok(InsertOutcome::AlreadyExists);
        }

        let mut stored = instance.clone();
        stored.increment_version();
        instances.insert(correlation_id, stored);
        instance.increment_version();
        Ok(InsertOutcome::Inserted)
    }

    fn update(&self, instance: &mut SagaInstance<D>) -> Result<(), RepositoryError> {
        let correlation_id = instance.correlation_id();
        let mut instances = self.instances.write().map_err(|_| poisoned())?;
        let Some(current) = instances.get_mut(&correlation_id) else {
            return Err(RepositoryError::conflict(correlation_id, "instance no longer exists"));
        };

        ExpectedVersion::Exact(instance.version())
            .check(current.version())
            .map_err(|err| RepositoryError::conflict(correlation_id, err.to_string()))?;

        let mut stored = instance.clone();
        stored.increment_version();
        *current = stored;
        instance.increment_version();
        Ok(())
    }

    fn delete(&self, instance: &SagaInstance<D>) -> Result<(), RepositoryError> {
        let correlation_id = instance.correlation_id();
        let mut instances = self.instances.write().map_err(|_| poisoned())?;
        match instances.get(&correlation_id) {
            Some(current) if current.version() <= instance.version() => {
                instances.remove(&correlation_id);
                Ok(())
            }
            Some(current) => Err(RepositoryError::conflict(
                correlation_id,
                format!(
                    "stored version {} is newer than {}",
                    current.version(),
                    instance.version()
                ),
            )),
            None => Err(RepositoryError::conflict(correlation_id, "instance no longer exists")),
        }
    }

    fn query(&self, query: &SagaQuery<D>) -> Result<Vec<CorrelationId>, RepositoryError> {
        let instances = self.instances.read().map_err(|_| poisoned())?;
        Ok(instances
            .values()
            .filter(|instance| query.matches(instance))
            .map(|instance| instance.correlation_id())
            .collect())
    }
}
