//! Typed event handles.

use std::borrow::Cow;
use std::marker::PhantomData;

use serde::Serialize;

/// Stable name of a declared event; the key of the machine's event table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EventName(Cow<'static, str>);

impl EventName {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EventName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an event carrying messages of type `T`.
///
/// Handles are returned by the builder and are cheap to clone. They carry no
/// behavior; the machine resolves them through its event table by name.
pub struct Event<T> {
    name: EventName,
    _message: PhantomData<fn() -> T>,
}

impl<T> Event<T> {
    pub(crate) fn new(name: EventName) -> Self {
        Self {
            name,
            _message: PhantomData,
        }
    }

    pub fn name(&self) -> &EventName {
        &self.name
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> core::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Event").field(&self.name).finish()
    }
}

impl<T> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for Event<T> {}
