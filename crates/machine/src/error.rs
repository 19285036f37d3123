//! Engine-level errors.

use thiserror::Error;

use sagaflow_core::{CorrelationId, Fault, State};

use crate::event::EventName;

/// A state machine declaration that cannot be built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    #[error("state '{0}' declared twice")]
    DuplicateState(String),

    #[error("event '{0}' declared twice")]
    DuplicateEvent(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("event '{0}' was not declared on this machine (or has a different message type)")]
    UnknownEvent(EventName),

    #[error("event '{event}' refers to undeclared state '{state}'")]
    UndeclaredState { event: EventName, state: String },

    #[error("event '{0}' initiates missing instances but is not accepted in the Initial state")]
    InitiateWithoutInitialBinding(EventName),
}

/// Failure while raising an event against an instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// No transition for this (state, event) pair and no fallback.
    #[error("event '{event}' not accepted in state {state} (instance {correlation_id})")]
    NotAccepted {
        event: EventName,
        state: State,
        correlation_id: CorrelationId,
    },

    #[error("unknown event '{0}'")]
    UnknownEvent(EventName),

    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    /// An activity failed and no `catch` block handled it.
    #[error("activity fault while handling '{event}': {fault}")]
    Fault { event: EventName, fault: Fault },

    /// The scheduler rejected a call and no `catch` block handled it.
    #[error("scheduler failure while handling '{event}': {message}")]
    Scheduler { event: EventName, message: String },
}

impl MachineError {
    pub fn is_not_accepted(&self) -> bool {
        matches!(self, MachineError::NotAccepted { .. })
    }
}
