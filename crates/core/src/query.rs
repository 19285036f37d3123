//! Predicates over stored instances, used by query-based correlation.

use std::sync::Arc;

use crate::id::RequestId;
use crate::instance::SagaInstance;

/// What a backend may index on to narrow a query before the predicate runs.
///
/// A hint never replaces the predicate; every candidate is still checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryHint {
    /// Only instances with this request id in one of their request slots can match.
    PendingRequest(RequestId),
}

/// A predicate selecting zero or more saga instances.
pub struct SagaQuery<D> {
    description: String,
    predicate: Arc<dyn Fn(&SagaInstance<D>) -> bool + Send + Sync>,
    hint: Option<QueryHint>,
}

impl<D> SagaQuery<D> {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&SagaInstance<D>) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: QueryHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn hint(&self) -> Option<QueryHint> {
        self.hint
    }

    pub fn matches(&self, instance: &SagaInstance<D>) -> bool {
        (self.predicate)(instance)
    }

    /// Human-readable form, used in logs.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<D> Clone for SagaQuery<D> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            predicate: Arc::clone(&self.predicate),
            hint: self.hint,
        }
    }
}

impl<D> core::fmt::Debug for SagaQuery<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaQuery")
            .field("description", &self.description)
            .field("hint", &self.hint)
            .finish_non_exhaustive()
    }
}
