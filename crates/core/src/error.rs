//! Error model shared by every saga crate.

use std::borrow::Cow;

use thiserror::Error;

/// Result type used by core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Kept to deterministic failures of the primitives themselves. Engine and
/// storage failures have their own error types further up the stack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A name (state, event, request, schedule) was empty or reserved.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A stored version did not match the expected one (optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Classifier used to match faults in `catch` blocks.
///
/// Kinds are compared by name, so a kind declared as a constant in one module
/// matches faults raised with the same name anywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaultKind(Cow<'static, str>);

impl FaultKind {
    /// Raised when an activity cannot serialize an outbound message.
    pub const SERIALIZATION: FaultKind = FaultKind::from_static("sagaflow.serialization");
    /// Raised when the scheduler rejects a schedule or cancel call.
    pub const SCHEDULER: FaultKind = FaultKind::from_static("sagaflow.scheduler");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for FaultKind {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for FaultKind {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

/// A failure raised by a user-supplied activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    kind: FaultKind,
    message: String,
}

impl Fault {
    pub fn new(kind: impl Into<FaultKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &FaultKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this fault was raised with the given kind.
    pub fn is(&self, kind: &FaultKind) -> bool {
        &self.kind == kind
    }

    pub fn serialization(err: impl core::fmt::Display) -> Self {
        Self::new(FaultKind::SERIALIZATION, err.to_string())
    }

    pub fn scheduler(err: impl core::fmt::Display) -> Self {
        Self::new(FaultKind::SCHEDULER, err.to_string())
    }
}
