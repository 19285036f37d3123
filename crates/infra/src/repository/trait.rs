use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use sagaflow_core::{CorrelationId, SagaInstance, SagaQuery};

/// Repository operation error.
///
/// `ConcurrencyConflict` is the only variant a retry collaborator should act
/// on; everything else is an infrastructure failure.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("concurrency conflict for {correlation_id}: {message}")]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        message: String,
    },

    #[error("timed out after {waited:?} waiting for the lock on {correlation_id}")]
    LockTimeout {
        correlation_id: CorrelationId,
        waited: Duration,
    },

    #[error("instance serialization failed: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn conflict(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self::ConcurrencyConflict {
            correlation_id,
            message: message.into(),
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, RepositoryError::ConcurrencyConflict { .. })
    }
}

/// Result of [`SagaRepository::insert`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The instance is stored and its version is now 1.
    Inserted,
    /// Another writer stored the same correlation id first. Reload it.
    AlreadyExists,
}

/// How a repository protects one instance against concurrent dispatches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Conditional writes on the version; a lost race surfaces as a conflict.
    Optimistic,
    /// Exclusive per-instance lock held from load to write, plus the version check.
    Pessimistic { lock_timeout: Duration },
}

impl ConcurrencyMode {
    pub fn is_pessimistic(&self) -> bool {
        matches!(self, ConcurrencyMode::Pessimistic { .. })
    }
}

/// Exclusive hold on one correlation id, released on drop.
///
/// Optimistic repositories hand out guards that hold nothing.
pub struct InstanceLock {
    correlation_id: CorrelationId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl InstanceLock {
    /// A guard that holds nothing.
    pub fn unlocked(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            release: None,
        }
    }

    /// A guard that runs `release` when dropped.
    pub fn exclusive<F>(correlation_id: CorrelationId, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            correlation_id,
            release: Some(Box::new(release)),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn is_exclusive(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl core::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("correlation_id", &self.correlation_id)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

/// Concurrency-safe storage contract for saga instances.
///
/// ## Versioning
///
/// A stored instance carries the version it was written at. `insert` writes
/// version 1. `update` succeeds only if the stored version is still the one
/// the caller loaded, and writes that version plus one. `delete` succeeds only
/// if the stored version is not newer than the caller's. Every failed
/// condition is a [`RepositoryError::ConcurrencyConflict`] and leaves the
/// stored row untouched.
///
/// ## Locking
///
/// The pipeline calls `acquire` before `load` and keeps the guard until the
/// write step returns. Pessimistic backends block other dispatches for the
/// same id in between; they still check versions.
pub trait SagaRepository<D>: Send + Sync {
    fn acquire(&self, correlation_id: CorrelationId) -> Result<InstanceLock, RepositoryError>;

    fn load(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance<D>>, RepositoryError>;

    /// Store a new instance. On success the instance's version is raised to 1.
    fn insert(&self, instance: &mut SagaInstance<D>) -> Result<InsertOutcome, RepositoryError>;

    /// Conditionally overwrite the stored instance; raises the version on success.
    fn update(&self, instance: &mut SagaInstance<D>) -> Result<(), RepositoryError>;

    fn delete(&self, instance: &SagaInstance<D>) -> Result<(), RepositoryError>;

    /// Drop an instance without writing anything.
    fn discard(&self, instance: &SagaInstance<D>) {
        trace!(correlation_id = %instance.correlation_id(), version = instance.version(), "instance discarded");
    }

    /// Correlation ids of every stored instance matching `query`, in ascending order.
    fn query(&self, query: &SagaQuery<D>) -> Result<Vec<CorrelationId>, RepositoryError>;
}

impl<D, R> SagaRepository<D> for Arc<R>
where
    R: SagaRepository<D> + ?Sized,
{
    fn acquire(&self, correlation_id: CorrelationId) -> Result<InstanceLock, RepositoryError> {
        (**self).acquire(correlation_id)
    }

    fn load(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance<D>>, RepositoryError> {
        (**self).load(correlation_id)
    }

    fn insert(&self, instance: &mut SagaInstance<D>) -> Result<InsertOutcome, RepositoryError> {
        (**self).insert(instance)
    }

    fn update(&self, instance: &mut SagaInstance<D>) -> Result<(), RepositoryError> {
        (**self).update(instance)
    }

    fn delete(&self, instance: &SagaInstance<D>) -> Result<(), RepositoryError> {
        (**self).delete(instance)
    }

    fn discard(&self, instance: &SagaInstance<D>) {
        (**self).discard(instance)
    }

    fn query(&self, query: &SagaQuery<D>) -> Result<Vec<CorrelationId>, RepositoryError> {
        (**self).query(query)
    }
}
