//! `sagaflow-infra`: running saga state machines against storage.
//!
//! - [`repository`]: the instance storage contract and its backends
//! - [`dispatcher`]: the per-message unit of work (correlate, load, raise, persist, publish)
//! - [`retry`]: re-running the pipeline on concurrency conflicts
//! - [`worker`]: background threads feeding subscriptions into the pipeline
//! - [`config`]: environment configuration

pub mod config;
pub mod dispatcher;
pub mod repository;
pub mod retry;
pub mod worker;

pub use config::{ConfigError, RepositoryBackend, SagaConfig};
pub use dispatcher::{DispatchError, DispatchOutcome, InstanceOutcome, PersistAction, PipelineSegment, SagaDispatcher};
pub use repository::{
    ConcurrencyMode, InMemorySagaRepository, InsertOutcome, InstanceLock, PostgresSagaRepository, RepositoryError,
    SagaRepository,
};
pub use retry::{Backoff, RetryPolicy, retry_on_conflict};
pub use worker::{SagaWorker, WorkerHandle, WorkerStats};
