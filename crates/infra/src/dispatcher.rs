//! Saga dispatch pipeline (application-level orchestration).
//!
//! The `SagaDispatcher` ties one [`StateMachine`] to a repository, an outbound
//! bus and a scheduler, and runs every inbound message through the same unit
//! of work:
//!
//! ```text
//! ConsumeContext<T>
//!   ↓
//! 1. Resolve correlation (id, query, or none)
//!   ↓
//! 2. Acquire + load the instance (or create it per the not-found policy)
//!   ↓
//! 3. Filter, then raise the event on the machine
//!   ↓
//! 4. Persist: insert / update / delete (completion predicate) / discard
//!   ↓
//! 5. Publish the outbox to the bus
//! ```
//!
//! A new instance is written with a single insert after its first
//! transition. If another dispatch inserted the same id in the meantime the
//! pipeline reloads it and runs the message against the stored instance.
//!
//! The dispatcher never retries a [`DispatchError::ConcurrencyConflict`];
//! wrap it with [`crate::retry`] for that.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use sagaflow_core::{CorrelationId, Fault, SagaData, SagaInstance, SagaQuery, State};
use sagaflow_machine::{
    ConsumeContext, CorrelationTarget, DeclarationError, Disposition, Event, EventName, MachineError, Message,
    MessageBus, MessageScheduler, OutboundMessage, StateMachine,
};

use crate::repository::{InsertOutcome, RepositoryError, SagaRepository};

/// Attempts at creating a missing instance before giving up on a racing writer.
const INSERT_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The instance's current state has no behavior for the event.
    #[error("event '{event}' not accepted in state {state} (instance {correlation_id})")]
    NotAccepted {
        event: EventName,
        state: State,
        correlation_id: CorrelationId,
    },

    /// A conditional write lost to a concurrent dispatch; retry the whole pipeline.
    #[error("concurrency conflict for {correlation_id}: {message}")]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        message: String,
    },

    #[error("activity fault while handling '{event}': {fault}")]
    Fault { event: EventName, fault: Fault },

    #[error("scheduler failure while handling '{event}': {message}")]
    Scheduler { event: EventName, message: String },

    /// The event has no correlation and cannot be routed to an instance.
    #[error("event '{event}' is uncorrelated")]
    Uncorrelated { event: EventName },

    /// The event is correlated but this message carried no identifier.
    #[error("message for '{event}' carries no correlation value")]
    MissingCorrelation { event: EventName },

    #[error("unknown event '{0}'")]
    UnknownEvent(EventName),

    #[error("invalid state machine: {0}")]
    Declaration(DeclarationError),

    /// The delivery was cancelled before the write step; nothing was stored.
    #[error("dispatch of '{event}' for {correlation_id} cancelled before persistence")]
    Cancelled {
        event: EventName,
        correlation_id: CorrelationId,
    },

    #[error(transparent)]
    Repository(RepositoryError),

    /// Publication failed after a successful write (at-least-once; retry may duplicate).
    #[error("outbox publication failed after persistence: {0}")]
    Publish(String),
}

impl DispatchError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DispatchError::ConcurrencyConflict { .. })
    }

    pub fn is_not_accepted(&self) -> bool {
        matches!(self, DispatchError::NotAccepted { .. })
    }
}

impl From<RepositoryError> for DispatchError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::ConcurrencyConflict {
                correlation_id,
                message,
            } => DispatchError::ConcurrencyConflict {
                correlation_id,
                message,
            },
            other => DispatchError::Repository(other),
        }
    }
}

impl From<MachineError> for DispatchError {
    fn from(value: MachineError) -> Self {
        match value {
            MachineError::NotAccepted {
                event,
                state,
                correlation_id,
            } => DispatchError::NotAccepted {
                event,
                state,
                correlation_id,
            },
            MachineError::UnknownEvent(event) => DispatchError::UnknownEvent(event),
            MachineError::Declaration(err) => DispatchError::Declaration(err),
            MachineError::Fault { event, fault } => DispatchError::Fault { event, fault },
            MachineError::Scheduler { event, message } => DispatchError::Scheduler { event, message },
        }
    }
}

/// What the write step did with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistAction {
    Inserted,
    Updated,
    Deleted,
    Discarded,
}

/// Result of running one message against one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceOutcome {
    pub correlation_id: CorrelationId,
    pub event: EventName,
    pub from: State,
    pub to: State,
    pub disposition: Disposition,
    pub action: PersistAction,
    /// Stored version after the write (unchanged when discarded or deleted).
    pub version: u64,
    pub published: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The message reached at least one instance.
    Applied { instances: Vec<InstanceOutcome> },
    /// No instance exists and the not-found policy discarded the message.
    NotFound,
}

impl DispatchOutcome {
    pub fn instances(&self) -> &[InstanceOutcome] {
        match self {
            DispatchOutcome::Applied { instances } => instances,
            DispatchOutcome::NotFound => &[],
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchOutcome::NotFound)
    }

    fn from_instances(instances: Vec<InstanceOutcome>) -> Self {
        if instances.is_empty() {
            DispatchOutcome::NotFound
        } else {
            DispatchOutcome::Applied { instances }
        }
    }
}

enum Applied {
    Done(InstanceOutcome),
    InsertRaced,
}

/// Reusable dispatch engine for one saga state machine.
///
/// ## Generic Parameters
///
/// - `D`: saga data carried by every instance
/// - `R`: repository implementation (must implement `SagaRepository<D>`)
/// - `B`: bus implementation receiving the outbox (must implement `MessageBus<OutboundMessage>`)
pub struct SagaDispatcher<D, R, B> {
    machine: Arc<StateMachine<D>>,
    repository: R,
    bus: B,
    scheduler: Arc<dyn MessageScheduler>,
}

impl<D, R, B> SagaDispatcher<D, R, B> {
    pub fn new(machine: Arc<StateMachine<D>>, repository: R, bus: B, scheduler: Arc<dyn MessageScheduler>) -> Self {
        Self {
            machine,
            repository,
            bus,
            scheduler,
        }
    }

    pub fn machine(&self) -> &StateMachine<D> {
        &self.machine
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (Arc<StateMachine<D>>, R, B) {
        (self.machine, self.repository, self.bus)
    }
}

impl<D, R, B> SagaDispatcher<D, R, B>
where
    D: SagaData,
    R: SagaRepository<D>,
    B: MessageBus<OutboundMessage>,
{
    /// Run one delivery through the full pipeline.
    ///
    /// Query correlation applies the message to every matching instance in
    /// id order and stops at the first error; instances already written stay
    /// written.
    pub fn dispatch<T: Message>(
        &self,
        event: &Event<T>,
        ctx: &ConsumeContext<T>,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self.machine.resolve(event, ctx)? {
            CorrelationTarget::Instance(correlation_id) => {
                let outcome = self.dispatch_instance(event, ctx, correlation_id, None)?;
                Ok(DispatchOutcome::from_instances(outcome.into_iter().collect()))
            }
            CorrelationTarget::Query(query) => {
                let ids = self.repository.query(&query)?;
                debug!(
                    event = %event.name(),
                    query = %query.description(),
                    matches = ids.len(),
                    "query correlation resolved"
                );
                if ids.is_empty() {
                    let correlation_id = ctx.correlation_id().unwrap_or_else(CorrelationId::new);
                    let outcome = self.dispatch_instance(event, ctx, correlation_id, None)?;
                    return Ok(DispatchOutcome::from_instances(outcome.into_iter().collect()));
                }

                let mut instances = Vec::with_capacity(ids.len());
                for correlation_id in ids {
                    instances.extend(self.dispatch_instance(event, ctx, correlation_id, Some(&query))?);
                }
                Ok(DispatchOutcome::from_instances(instances))
            }
            CorrelationTarget::Unresolved => Err(DispatchError::MissingCorrelation {
                event: event.name().clone(),
            }),
            CorrelationTarget::Uncorrelated => Err(DispatchError::Uncorrelated {
                event: event.name().clone(),
            }),
        }
    }

    /// `None` when the instance is missing and the message was discarded.
    ///
    /// `matched` is the query that selected the instance. It is checked again
    /// after loading; an instance that stopped matching is left alone, and a
    /// missing one is never created.
    fn dispatch_instance<T: Message>(
        &self,
        event: &Event<T>,
        ctx: &ConsumeContext<T>,
        correlation_id: CorrelationId,
        matched: Option<&SagaQuery<D>>,
    ) -> Result<Option<InstanceOutcome>, DispatchError> {
        let may_initiate = matched.is_none();
        for attempt in 1..=INSERT_ATTEMPTS {
            let _lock = self.repository.acquire(correlation_id)?;

            let (instance, is_new) = match self.repository.load(correlation_id)? {
                Some(instance) if matched.is_some_and(|query| !query.matches(&instance)) => {
                    debug!(
                        correlation_id = %correlation_id,
                        event = %event.name(),
                        "instance no longer matches the correlation query; message discarded"
                    );
                    self.repository.discard(&instance);
                    return Ok(None);
                }
                Some(instance) => (instance, false),
                None if may_initiate && self.machine.should_initiate(event, ctx)? => {
                    (SagaInstance::new(correlation_id, D::default()), true)
                }
                None => {
                    debug!(
                        correlation_id = %correlation_id,
                        event = %event.name(),
                        "no instance; message discarded"
                    );
                    return Ok(None);
                }
            };

            match self.apply(event, ctx, instance, is_new)? {
                Applied::Done(outcome) => return Ok(Some(outcome)),
                Applied::InsertRaced => {
                    warn!(
                        correlation_id = %correlation_id,
                        event = %event.name(),
                        attempt,
                        "instance created concurrently; reloading"
                    );
                }
            }
        }

        Err(DispatchError::ConcurrencyConflict {
            correlation_id,
            message: "instance inserted and removed concurrently".to_string(),
        })
    }

    fn apply<T: Message>(
        &self,
        event: &Event<T>,
        ctx: &ConsumeContext<T>,
        mut instance: SagaInstance<D>,
        is_new: bool,
    ) -> Result<Applied, DispatchError> {
        let correlation_id = instance.correlation_id();
        let from = instance.current_state().clone();

        if !is_new && !self.machine.filter_accepts(event, &instance, ctx)? {
            debug!(correlation_id = %correlation_id, event = %event.name(), "filtered out");
            self.repository.discard(&instance);
            return Ok(Applied::Done(InstanceOutcome {
                correlation_id,
                event: event.name().clone(),
                to: from.clone(),
                from,
                disposition: Disposition::Filtered,
                action: PersistAction::Discarded,
                version: instance.version(),
                published: 0,
            }));
        }

        let transition = match self.machine.raise(event, &mut instance, ctx, self.scheduler.as_ref()) {
            Ok(transition) => transition,
            Err(err) => {
                self.repository.discard(&instance);
                return Err(err.into());
            }
        };

        if !transition.is_accepted() {
            self.repository.discard(&instance);
            return Ok(Applied::Done(InstanceOutcome {
                correlation_id,
                event: transition.event,
                from: transition.from,
                to: transition.to,
                disposition: transition.disposition,
                action: PersistAction::Discarded,
                version: instance.version(),
                published: 0,
            }));
        }

        if ctx.is_cancelled() {
            self.repository.discard(&instance);
            return Err(DispatchError::Cancelled {
                event: event.name().clone(),
                correlation_id,
            });
        }

        let completed = self.machine.is_completed(&instance);
        let action = match (is_new, completed) {
            (true, true) => {
                self.repository.discard(&instance);
                PersistAction::Discarded
            }
            (true, false) => match self.repository.insert(&mut instance)? {
                InsertOutcome::Inserted => PersistAction::Inserted,
                InsertOutcome::AlreadyExists => return Ok(Applied::InsertRaced),
            },
            (false, true) => {
                self.repository.delete(&instance)?;
                PersistAction::Deleted
            }
            (false, false) => {
                self.repository.update(&mut instance)?;
                PersistAction::Updated
            }
        };

        match action {
            PersistAction::Inserted => info!(
                correlation_id = %correlation_id,
                machine = %self.machine.name(),
                state = %transition.to,
                "saga instance created"
            ),
            PersistAction::Deleted | PersistAction::Discarded if completed => info!(
                correlation_id = %correlation_id,
                machine = %self.machine.name(),
                "saga instance completed"
            ),
            _ => {}
        }

        let published = transition.outbox.len();
        for message in transition.outbox {
            self.bus
                .publish(message)
                .map_err(|err| DispatchError::Publish(format!("{err:?}")))?;
        }

        debug!(
            correlation_id = %correlation_id,
            event = %transition.event,
            from = %transition.from,
            to = %transition.to,
            action = ?action,
            version = instance.version(),
            published,
            "message dispatched"
        );

        Ok(Applied::Done(InstanceOutcome {
            correlation_id,
            event: transition.event,
            from: transition.from,
            to: transition.to,
            disposition: transition.disposition,
            action,
            version: instance.version(),
            published,
        }))
    }
}

impl<D, R, B> SagaDispatcher<D, R, B>
where
    D: SagaData,
    R: SagaRepository<D> + 'static,
    B: MessageBus<OutboundMessage> + 'static,
{
    /// A handler bound to `event`, for workers and transports.
    pub fn connect<T: Message>(self: &Arc<Self>, event: &Event<T>) -> PipelineSegment<T> {
        let dispatcher = Arc::clone(self);
        let bound = event.clone();
        PipelineSegment::new(event.name().clone(), move |ctx: &ConsumeContext<T>| {
            dispatcher.dispatch(&bound, ctx)
        })
    }
}

type SegmentFn<T> = Arc<dyn Fn(&ConsumeContext<T>) -> Result<DispatchOutcome, DispatchError> + Send + Sync>;

/// The pipeline for one message type, detached from the dispatcher's generics.
pub struct PipelineSegment<T> {
    event: EventName,
    handler: SegmentFn<T>,
}

impl<T: Message> PipelineSegment<T> {
    pub fn new<F>(event: EventName, handler: F) -> Self
    where
        F: Fn(&ConsumeContext<T>) -> Result<DispatchOutcome, DispatchError> + Send + Sync + 'static,
    {
        Self {
            event,
            handler: Arc::new(handler),
        }
    }

    pub fn event(&self) -> &EventName {
        &self.event
    }

    pub fn message_type(&self) -> &'static str {
        T::message_type()
    }

    pub fn handle(&self, ctx: &ConsumeContext<T>) -> Result<DispatchOutcome, DispatchError> {
        (self.handler)(ctx)
    }
}

impl<T> Clone for PipelineSegment<T> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T> core::fmt::Debug for PipelineSegment<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineSegment")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}
