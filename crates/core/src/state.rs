//! Named lifecycle states.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A named lifecycle position of a saga instance.
///
/// States compare by name. `Initial` and `Final` exist in every state machine
/// and are reserved; user states are declared through the machine builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Cow<'static, str>);

impl State {
    /// Position of an instance that has not consumed any event yet.
    pub const INITIAL: State = State(Cow::Borrowed("Initial"));
    /// Terminal position; reaching it typically completes the instance.
    pub const FINAL: State = State(Cow::Borrowed("Final"));

    /// Create a user state, rejecting empty and reserved names.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::invalid_name("state name must not be empty"));
        }
        let state = State(name);
        if state.is_reserved() {
            return Err(CoreError::invalid_name(format!("state '{state}' is reserved")));
        }
        Ok(state)
    }

    /// Rebuild a state from a persisted name. Reserved names are accepted.
    pub fn from_stored(name: impl Into<Cow<'static, str>>) -> Self {
        State(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }

    pub fn is_final(&self) -> bool {
        *self == Self::FINAL
    }

    pub fn is_reserved(&self) -> bool {
        self.is_initial() || self.is_final()
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_are_rejected() {
        assert!(State::new("Initial").is_err());
        assert!(State::new("Final").is_err());
        assert!(State::new("  ").is_err());
    }

    #[test]
    fn owned_and_borrowed_names_compare_equal() {
        let borrowed = State::new("Running").unwrap();
        let owned = State::new(String::from("Running")).unwrap();
        assert_eq!(borrowed, owned);
        assert_eq!(State::from_stored(String::from("Final")), State::FINAL);
    }

    #[test]
    fn serializes_as_plain_name() {
        let json = serde_json::to_string(&State::INITIAL).unwrap();
        assert_eq!(json, "\"Initial\"");
        let back: State = serde_json::from_str("\"Final\"").unwrap();
        assert!(back.is_final());
    }
}
