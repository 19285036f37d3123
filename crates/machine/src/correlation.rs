//! Event correlation: how a message finds its saga instance.
//!
//! Every event is correlated exactly one way, fixed when the machine is
//! declared:
//!
//! | Strategy      | Source                                              |
//! |---------------|-----------------------------------------------------|
//! | `Identity`    | the message implements [`CorrelatedBy`]             |
//! | `Convention`  | a convention registered in [`CorrelationConventions`] |
//! | `ById`        | an explicit extractor over the consume context      |
//! | `ByQuery`     | an instance key paired with a message key           |
//! | `Uncorrelated`| none of the above; the event cannot be routed       |
//!
//! Nothing is inferred per message.
//!
//! [`CorrelatedBy`]: crate::message::CorrelatedBy

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use sagaflow_core::{CorrelationId, SagaInstance, SagaQuery};

use crate::context::ConsumeContext;
use crate::event::EventName;
use crate::message::{CorrelatedBy, Message};

pub type CorrelationFn<T> = Arc<dyn Fn(&ConsumeContext<T>) -> Option<CorrelationId> + Send + Sync>;
pub type QueryFn<D, T> = Arc<dyn Fn(&ConsumeContext<T>) -> Option<SagaQuery<D>> + Send + Sync>;
pub type FilterFn<D, T> = Arc<dyn Fn(&SagaInstance<D>, &ConsumeContext<T>) -> bool + Send + Sync>;

/// How one event extracts its instance identifier.
pub enum CorrelationStrategy<D, T> {
    Identity(fn(&T) -> CorrelationId),
    Convention(fn(&T) -> Option<CorrelationId>),
    ById(CorrelationFn<T>),
    ByQuery(QueryFn<D, T>),
    Uncorrelated,
}

impl<D, T> CorrelationStrategy<D, T> {
    pub fn kind(&self) -> CorrelationKind {
        match self {
            CorrelationStrategy::Identity(_) => CorrelationKind::Identity,
            CorrelationStrategy::Convention(_) => CorrelationKind::Convention,
            CorrelationStrategy::ById(_) => CorrelationKind::ById,
            CorrelationStrategy::ByQuery(_) => CorrelationKind::ByQuery,
            CorrelationStrategy::Uncorrelated => CorrelationKind::Uncorrelated,
        }
    }

    pub fn resolve(&self, ctx: &ConsumeContext<T>) -> CorrelationTarget<D> {
        let resolved = match self {
            CorrelationStrategy::Identity(extract) => Some(CorrelationTarget::Instance(extract(ctx.message()))),
            CorrelationStrategy::Convention(extract) => extract(ctx.message()).map(CorrelationTarget::Instance),
            CorrelationStrategy::ById(extract) => extract(ctx).map(CorrelationTarget::Instance),
            CorrelationStrategy::ByQuery(build) => build(ctx).map(CorrelationTarget::Query),
            CorrelationStrategy::Uncorrelated => return CorrelationTarget::Uncorrelated,
        };
        resolved.unwrap_or(CorrelationTarget::Unresolved)
    }
}

/// Queryable discriminator of a [`CorrelationStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKind {
    Identity,
    Convention,
    ById,
    ByQuery,
    Uncorrelated,
}

/// Result of correlating one delivery.
#[derive(Debug, Clone)]
pub enum CorrelationTarget<D> {
    /// Exactly one instance, by id.
    Instance(CorrelationId),
    /// Every stored instance matching the query.
    Query(SagaQuery<D>),
    /// The extractor found no identifier in this message.
    Unresolved,
    /// The event has no correlation at all.
    Uncorrelated,
}

/// What to do when the correlated instance does not exist.
pub enum NotFoundPolicy<T> {
    /// Create a new instance; the event must be accepted in `Initial`.
    Initiate,
    /// Drop the message without error.
    Discard,
    /// Decide per message: `true` creates, `false` discards.
    Custom(Arc<dyn Fn(&ConsumeContext<T>) -> bool + Send + Sync>),
}

impl<T> NotFoundPolicy<T> {
    pub fn custom<F>(decide: F) -> Self
    where
        F: Fn(&ConsumeContext<T>) -> bool + Send + Sync + 'static,
    {
        NotFoundPolicy::Custom(Arc::new(decide))
    }

    pub fn kind(&self) -> MissingKind {
        match self {
            NotFoundPolicy::Initiate => MissingKind::Initiate,
            NotFoundPolicy::Discard => MissingKind::Discard,
            NotFoundPolicy::Custom(_) => MissingKind::Custom,
        }
    }

    pub fn should_initiate(&self, ctx: &ConsumeContext<T>) -> bool {
        match self {
            NotFoundPolicy::Initiate => true,
            NotFoundPolicy::Discard => false,
            NotFoundPolicy::Custom(decide) => decide(ctx),
        }
    }
}

impl<T> Clone for NotFoundPolicy<T> {
    fn clone(&self) -> Self {
        match self {
            NotFoundPolicy::Initiate => NotFoundPolicy::Initiate,
            NotFoundPolicy::Discard => NotFoundPolicy::Discard,
            NotFoundPolicy::Custom(decide) => NotFoundPolicy::Custom(Arc::clone(decide)),
        }
    }
}

impl<T> core::fmt::Debug for NotFoundPolicy<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.kind(), f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingKind {
    Initiate,
    Discard,
    Custom,
}

/// One entry of a machine's correlation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationInfo {
    pub event: EventName,
    pub message_type: &'static str,
    pub kind: CorrelationKind,
    pub missing: MissingKind,
    pub filtered: bool,
}

/// Correlation conventions declared by the outbound topology of message types.
///
/// Registered once, before events are declared; an event whose message type
/// has a convention is correlated by it unless configured explicitly.
#[derive(Default)]
pub struct CorrelationConventions {
    conventions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CorrelationConventions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Message>(&mut self, extract: fn(&T) -> Option<CorrelationId>) -> &mut Self {
        self.conventions.insert(TypeId::of::<T>(), Box::new(extract));
        self
    }

    pub fn lookup<T: Message>(&self) -> Option<fn(&T) -> Option<CorrelationId>> {
        self.conventions
            .get(&TypeId::of::<T>())
            .and_then(|f| f.downcast_ref::<fn(&T) -> Option<CorrelationId>>())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.conventions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conventions.is_empty()
    }
}

impl core::fmt::Debug for CorrelationConventions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CorrelationConventions")
            .field("registered", &self.conventions.len())
            .finish()
    }
}

/// Per-event correlation configuration, passed to `event_with` and `schedule`.
pub struct EventCorrelator<D, T> {
    pub(crate) strategy: Option<CorrelationStrategy<D, T>>,
    pub(crate) missing: Option<NotFoundPolicy<T>>,
    pub(crate) filter: Option<FilterFn<D, T>>,
}

impl<D, T> Default for EventCorrelator<D, T> {
    fn default() -> Self {
        Self {
            strategy: None,
            missing: None,
            filter: None,
        }
    }
}

impl<D, T> EventCorrelator<D, T>
where
    D: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Correlate by the message's own correlation id.
    pub fn by_identity(mut self) -> Self
    where
        T: CorrelatedBy,
    {
        self.strategy = Some(CorrelationStrategy::Identity(<T as CorrelatedBy>::correlation_id));
        self
    }

    /// Correlate by an identifier extracted from the delivery.
    pub fn by_id<F>(mut self, extract: F) -> Self
    where
        F: Fn(&ConsumeContext<T>) -> Option<CorrelationId> + Send + Sync + 'static,
    {
        self.strategy = Some(CorrelationStrategy::ById(Arc::new(extract)));
        self
    }

    /// Correlate every instance whose `instance_key` equals the message's `message_key`.
    pub fn by_key<K, I, M>(mut self, description: impl Into<String>, instance_key: I, message_key: M) -> Self
    where
        K: PartialEq + Send + Sync + 'static,
        I: Fn(&SagaInstance<D>) -> Option<K> + Send + Sync + 'static,
        M: Fn(&ConsumeContext<T>) -> Option<K> + Send + Sync + 'static,
    {
        let description = description.into();
        let instance_key = Arc::new(instance_key);
        self.strategy = Some(CorrelationStrategy::ByQuery(Arc::new(move |ctx: &ConsumeContext<T>| {
            let key = message_key(ctx)?;
            let instance_key = Arc::clone(&instance_key);
            Some(SagaQuery::new(description.clone(), move |instance: &SagaInstance<D>| {
                instance_key(instance).as_ref() == Some(&key)
            }))
        })));
        self
    }

    /// Correlate with a fully custom query.
    pub fn by_query<F>(mut self, build: F) -> Self
    where
        F: Fn(&ConsumeContext<T>) -> Option<SagaQuery<D>> + Send + Sync + 'static,
    {
        self.strategy = Some(CorrelationStrategy::ByQuery(Arc::new(build)));
        self
    }

    pub fn on_missing(mut self, policy: NotFoundPolicy<T>) -> Self {
        self.missing = Some(policy);
        self
    }

    /// Drop messages for instances that fail `filter` (checked after load).
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&SagaInstance<D>, &ConsumeContext<T>) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}
