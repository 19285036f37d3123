//! Saga instance storage boundary.
//!
//! The dispatch pipeline only talks to [`SagaRepository`]; backends decide
//! how the atomic conditional writes are achieved.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySagaRepository;
pub use postgres::PostgresSagaRepository;
pub use r#trait::{ConcurrencyMode, InsertOutcome, InstanceLock, RepositoryError, SagaRepository};
pub use sagaflow_core::SagaQuery;
