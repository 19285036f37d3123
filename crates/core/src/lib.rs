//! `sagaflow-core`: saga runtime building blocks.
//!
//! This crate contains the **pure** primitives shared by the state machine
//! engine and the storage layer: identifiers, states, the instance record and
//! the error model. No IO, no engine logic.

pub mod error;
pub mod id;
pub mod instance;
pub mod query;
pub mod state;

pub use error::{CoreError, CoreResult, Fault, FaultKind};
pub use id::{CorrelationId, MessageId, RequestId, TokenId};
pub use instance::{ExpectedVersion, SagaData, SagaInstance};
pub use query::{QueryHint, SagaQuery};
pub use state::State;
