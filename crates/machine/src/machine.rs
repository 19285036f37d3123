//! State machine declaration and transition engine.
//!
//! A machine is declared once through [`StateMachineBuilder`] and is then
//! immutable. Its event table maps each [`EventName`] to a typed definition
//! holding the correlation rule and the behaviors per state. Raising an event
//! looks up behaviors in this order:
//!
//! 1. sub-protocol cleanup (request/schedule housekeeping), in any non-initial state
//! 2. the exact `(state, event)` entry
//! 3. an `ignore` declaration for the state
//! 4. the `during_any` entry (every state except `Initial`)
//!
//! If nothing applies the event is **not accepted**: an error, never a no-op,
//! and the instance is left as it was.

use std::any::Any;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use sagaflow_core::{Fault, FaultKind, SagaData, SagaInstance, State};

use crate::activity::{ActivityRef, BehaviorContext, run_all};
use crate::behavior::{self, EventActivities};
use crate::bus::OutboundMessage;
use crate::context::ConsumeContext;
use crate::correlation::{
    CorrelationConventions, CorrelationInfo, CorrelationStrategy, CorrelationTarget, EventCorrelator, FilterFn,
    NotFoundPolicy,
};
use crate::error::{DeclarationError, MachineError};
use crate::event::{Event, EventName};
use crate::message::{CorrelatedBy, Message};
use crate::request::{
    ClearRequest, Request, RequestFault, RequestIdFn, RequestSettings, RequestTimeoutExpired, pending_request_query,
};
use crate::schedule::{Schedule, ScheduleGate, ScheduleSettings};
use crate::scheduler::MessageScheduler;

/// How raising an event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Behaviors ran; the instance must be persisted.
    Accepted,
    /// The state declares the event ignored; nothing ran.
    Ignored,
    /// A scheduled message whose token no longer matches the instance.
    Stale,
    /// The correlation filter rejected the instance (set by the dispatch pipeline).
    Filtered,
}

/// Result of raising one event against one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: EventName,
    pub from: State,
    pub to: State,
    pub disposition: Disposition,
    /// Messages to publish after the instance is persisted.
    pub outbox: Vec<OutboundMessage>,
}

impl Transition {
    pub fn unchanged(event: EventName, state: State, disposition: Disposition) -> Self {
        Self {
            event,
            from: state.clone(),
            to: state,
            disposition,
            outbox: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.disposition == Disposition::Accepted
    }
}

/// Serializable view of one event's bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub event: EventName,
    pub message_type: &'static str,
    pub states: Vec<State>,
    pub ignored_in: Vec<State>,
    pub during_any: bool,
    pub housekeeping: bool,
    pub forwards_to: Option<EventName>,
}

/// Serializable view of a whole machine, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclarationTable {
    pub machine: String,
    pub states: Vec<State>,
    pub events: Vec<EventSummary>,
    pub correlations: Vec<CorrelationInfo>,
}

enum Completion<D> {
    Never,
    WhenFinalized,
    Custom(Arc<dyn Fn(&SagaInstance<D>) -> bool + Send + Sync>),
}

struct EventDefinition<D, T> {
    name: EventName,
    strategy: CorrelationStrategy<D, T>,
    missing: Option<NotFoundPolicy<T>>,
    filter: Option<FilterFn<D, T>>,
    housekeeping: Vec<ActivityRef<D, T>>,
    by_state: HashMap<State, Vec<ActivityRef<D, T>>>,
    during_any: Option<Vec<ActivityRef<D, T>>>,
    ignored: BTreeSet<State>,
    gate: Option<ScheduleGate>,
}

impl<D, T> EventDefinition<D, T> {
    fn new(
        name: EventName,
        strategy: CorrelationStrategy<D, T>,
        missing: Option<NotFoundPolicy<T>>,
        filter: Option<FilterFn<D, T>>,
    ) -> Self {
        Self {
            name,
            strategy,
            missing,
            filter,
            housekeeping: Vec::new(),
            by_state: HashMap::new(),
            during_any: None,
            ignored: BTreeSet::new(),
            gate: None,
        }
    }

    fn with_housekeeping(mut self, activity: ActivityRef<D, T>) -> Self {
        self.housekeeping.push(activity);
        self
    }

    fn with_gate(mut self, gate: ScheduleGate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn missing_policy(&self) -> NotFoundPolicy<T> {
        self.missing.clone().unwrap_or(NotFoundPolicy::Discard)
    }
}

/// Type-erased access to event definitions of any message type.
trait ErasedEvent<D>: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn correlation_info(&self) -> CorrelationInfo;
    fn summary(&self) -> EventSummary;
    fn finish(&mut self) -> Result<(), DeclarationError>;
}

impl<D, T> ErasedEvent<D> for EventDefinition<D, T>
where
    D: SagaData,
    T: Message,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn correlation_info(&self) -> CorrelationInfo {
        CorrelationInfo {
            event: self.name.clone(),
            message_type: T::message_type(),
            kind: self.strategy.kind(),
            missing: self.missing_policy().kind(),
            filtered: self.filter.is_some(),
        }
    }

    fn summary(&self) -> EventSummary {
        let mut states: Vec<State> = self.by_state.keys().cloned().collect();
        states.sort();
        EventSummary {
            event: self.name.clone(),
            message_type: T::message_type(),
            states,
            ignored_in: self.ignored.iter().cloned().collect(),
            during_any: self.during_any.is_some(),
            housekeeping: !self.housekeeping.is_empty(),
            forwards_to: self.gate.as_ref().map(|g| g.received.clone()),
        }
    }

    fn finish(&mut self) -> Result<(), DeclarationError> {
        let initial_binding = self.by_state.contains_key(&State::INITIAL);
        match &self.missing {
            None => {
                self.missing = Some(if initial_binding {
                    NotFoundPolicy::Initiate
                } else {
                    NotFoundPolicy::Discard
                });
                Ok(())
            }
            Some(NotFoundPolicy::Initiate) if !initial_binding => {
                Err(DeclarationError::InitiateWithoutInitialBinding(self.name.clone()))
            }
            Some(_) => Ok(()),
        }
    }
}

enum Slot {
    State(State),
    Any,
}

/// Declares states, events and behaviors, then freezes them into a [`StateMachine`].
///
/// Declaration mistakes (duplicate names, undeclared target states, ...) are
/// collected and reported by [`StateMachineBuilder::build`].
pub struct StateMachineBuilder<D> {
    name: String,
    states: Vec<State>,
    events: HashMap<EventName, Box<dyn ErasedEvent<D>>>,
    event_order: Vec<EventName>,
    conventions: CorrelationConventions,
    completion: Completion<D>,
    targets: Vec<(EventName, State)>,
    errors: Vec<DeclarationError>,
}

impl<D: SagaData> StateMachineBuilder<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            events: HashMap::new(),
            event_order: Vec::new(),
            conventions: CorrelationConventions::new(),
            completion: Completion::Never,
            targets: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Correlation conventions consulted by events declared afterwards.
    pub fn with_conventions(mut self, conventions: CorrelationConventions) -> Self {
        self.conventions = conventions;
        self
    }

    pub fn state(&mut self, name: impl Into<Cow<'static, str>>) -> State {
        let name = name.into();
        match State::new(name.clone()) {
            Ok(state) => {
                if self.states.contains(&state) {
                    self.errors.push(DeclarationError::DuplicateState(state.to_string()));
                } else {
                    self.states.push(state.clone());
                }
                state
            }
            Err(err) => {
                self.errors.push(DeclarationError::InvalidName(err.to_string()));
                State::from_stored(name)
            }
        }
    }

    /// Declare an event correlated by convention, or uncorrelated if none is registered.
    pub fn event<T: Message>(&mut self, name: impl Into<Cow<'static, str>>) -> Event<T> {
        self.event_with(name, |c| c)
    }

    /// Declare an event correlated by the message's own correlation id.
    pub fn correlated_event<T>(&mut self, name: impl Into<Cow<'static, str>>) -> Event<T>
    where
        T: Message + CorrelatedBy,
    {
        self.event_with(name, |c| c.by_identity())
    }

    /// Declare an event with explicit correlation, missing-instance policy or filter.
    pub fn event_with<T, F>(&mut self, name: impl Into<Cow<'static, str>>, configure: F) -> Event<T>
    where
        T: Message,
        F: FnOnce(EventCorrelator<D, T>) -> EventCorrelator<D, T>,
    {
        let correlator = configure(EventCorrelator::default());
        let strategy = self.strategy_or_convention(correlator.strategy);
        self.declare(EventDefinition::new(
            EventName::new(name),
            strategy,
            correlator.missing,
            correlator.filter,
        ))
    }

    /// Declare a request with its completed/faulted/timeout events and pending state.
    pub fn request<Req, Resp>(&mut self, name: &str, settings: RequestSettings) -> Request<Req, Resp>
    where
        Req: Message,
        Resp: Message,
    {
        let pending = self.state(format!("{name}.Pending"));

        let completed_id: RequestIdFn<Resp> = Arc::new(|ctx: &ConsumeContext<Resp>| ctx.request_id());
        let completed = self.declare(
            EventDefinition::<D, Resp>::new(
                EventName::new(format!("{name}.Completed")),
                CorrelationStrategy::ByQuery(pending_request_query(name.to_string(), completed_id.clone())),
                Some(NotFoundPolicy::Discard),
                None,
            )
            .with_housekeeping(Arc::new(ClearRequest::new(name.to_string(), &settings, true, completed_id))),
        );

        let faulted_id: RequestIdFn<RequestFault<Req>> =
            Arc::new(|ctx: &ConsumeContext<RequestFault<Req>>| ctx.request_id().or(Some(ctx.message().request_id)));
        let faulted = self.declare(
            EventDefinition::<D, RequestFault<Req>>::new(
                EventName::new(format!("{name}.Faulted")),
                CorrelationStrategy::ByQuery(pending_request_query(name.to_string(), faulted_id.clone())),
                Some(NotFoundPolicy::Discard),
                None,
            )
            .with_housekeeping(Arc::new(ClearRequest::new(name.to_string(), &settings, true, faulted_id))),
        );

        let expired_id: RequestIdFn<RequestTimeoutExpired<Req>> =
            Arc::new(|ctx: &ConsumeContext<RequestTimeoutExpired<Req>>| Some(ctx.message().request_id));
        let timeout_expired = self.declare(
            EventDefinition::<D, RequestTimeoutExpired<Req>>::new(
                EventName::new(format!("{name}.TimeoutExpired")),
                CorrelationStrategy::ByQuery(pending_request_query(name.to_string(), expired_id.clone())),
                Some(NotFoundPolicy::Discard),
                None,
            )
            .with_housekeeping(Arc::new(ClearRequest::new(name.to_string(), &settings, false, expired_id))),
        );

        Request::new(name.to_string(), settings, pending, completed, faulted, timeout_expired)
    }

    /// Declare a schedule. `configure` sets how delivered messages find their
    /// instance; missing instances are discarded unless configured otherwise.
    pub fn schedule<M, F>(&mut self, name: &str, settings: ScheduleSettings, configure: F) -> Schedule<M>
    where
        M: Message,
        F: FnOnce(EventCorrelator<D, M>) -> EventCorrelator<D, M>,
    {
        let correlator = configure(EventCorrelator::default());
        let strategy = self.strategy_or_convention(correlator.strategy);

        let received = self.declare(EventDefinition::<D, M>::new(
            EventName::new(format!("{name}.Received")),
            CorrelationStrategy::Uncorrelated,
            Some(NotFoundPolicy::Discard),
            None,
        ));
        let any_received = self.declare(
            EventDefinition::<D, M>::new(
                EventName::new(format!("{name}.AnyReceived")),
                strategy,
                Some(correlator.missing.unwrap_or(NotFoundPolicy::Discard)),
                correlator.filter,
            )
            .with_gate(ScheduleGate {
                schedule: name.to_string(),
                received: received.name().clone(),
            }),
        );

        Schedule::new(name.to_string(), settings, received, any_received)
    }

    /// Start a behavior for `event`; attach it with `initially`, `during` or `during_any`.
    pub fn when<T: Message>(&self, event: &Event<T>) -> EventActivities<D, T> {
        behavior::when(event)
    }

    pub fn initially<T: Message>(&mut self, activities: EventActivities<D, T>) -> &mut Self {
        self.bind(Slot::State(State::INITIAL), activities)
    }

    pub fn during<T: Message>(&mut self, states: &[&State], activities: EventActivities<D, T>) -> &mut Self {
        for state in states {
            self.bind(Slot::State((*state).clone()), activities.clone());
        }
        self
    }

    /// Bind to every state except `Initial`, as a fallback behind exact entries.
    pub fn during_any<T: Message>(&mut self, activities: EventActivities<D, T>) -> &mut Self {
        self.bind(Slot::Any, activities)
    }

    /// Accept `event` in `states` without doing anything.
    pub fn ignore<T: Message>(&mut self, states: &[&State], event: &Event<T>) -> &mut Self {
        for state in states {
            if !self.is_declared(state) {
                self.errors.push(DeclarationError::UndeclaredState {
                    event: event.name().clone(),
                    state: state.to_string(),
                });
                continue;
            }
            match self.definition_mut(event) {
                Some(definition) => {
                    definition.ignored.insert((*state).clone());
                }
                None => self.errors.push(DeclarationError::UnknownEvent(event.name().clone())),
            }
        }
        self
    }

    /// Instances satisfying `predicate` after a transition are deleted instead of updated.
    pub fn set_completed<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&SagaInstance<D>) -> bool + Send + Sync + 'static,
    {
        self.completion = Completion::Custom(Arc::new(predicate));
        self
    }

    pub fn set_completed_when_finalized(&mut self) -> &mut Self {
        self.completion = Completion::WhenFinalized;
        self
    }

    pub fn build(mut self) -> Result<StateMachine<D>, MachineError> {
        let undeclared: Vec<DeclarationError> = self
            .targets
            .iter()
            .filter(|(_, state)| !self.is_declared(state))
            .map(|(event, state)| DeclarationError::UndeclaredState {
                event: event.clone(),
                state: state.to_string(),
            })
            .collect();
        self.errors.extend(undeclared);

        for name in &self.event_order {
            if let Some(definition) = self.events.get_mut(name) {
                if let Err(err) = definition.finish() {
                    self.errors.push(err);
                }
            }
        }

        if let Some(first) = self.errors.into_iter().next() {
            return Err(first.into());
        }

        let mut states = Vec::with_capacity(self.states.len() + 2);
        states.push(State::INITIAL);
        states.extend(self.states);
        states.push(State::FINAL);

        debug!(machine = %self.name, states = states.len(), events = self.event_order.len(), "state machine built");

        Ok(StateMachine {
            name: self.name,
            states,
            events: self.events,
            event_order: self.event_order,
            completion: self.completion,
        })
    }

    fn strategy_or_convention<T: Message>(
        &self,
        explicit: Option<CorrelationStrategy<D, T>>,
    ) -> CorrelationStrategy<D, T> {
        explicit
            .or_else(|| self.conventions.lookup::<T>().map(CorrelationStrategy::Convention))
            .unwrap_or(CorrelationStrategy::Uncorrelated)
    }

    fn declare<T: Message>(&mut self, definition: EventDefinition<D, T>) -> Event<T> {
        let name = definition.name.clone();
        if name.as_str().trim().is_empty() {
            self.errors
                .push(DeclarationError::InvalidName("event name must not be empty".into()));
        } else if self.events.contains_key(&name) {
            self.errors.push(DeclarationError::DuplicateEvent(name.to_string()));
        } else {
            self.events.insert(name.clone(), Box::new(definition));
            self.event_order.push(name.clone());
        }
        Event::new(name)
    }

    fn bind<T: Message>(&mut self, slot: Slot, activities: EventActivities<D, T>) -> &mut Self {
        let (event, activities, targets) = activities.into_parts();
        let name = event.name().clone();

        if let Slot::State(state) = &slot {
            if !self.is_declared(state) {
                self.errors.push(DeclarationError::UndeclaredState {
                    event: name,
                    state: state.to_string(),
                });
                return self;
            }
        }
        self.targets
            .extend(targets.into_iter().map(|state| (name.clone(), state)));

        let Some(definition) = self.definition_mut(&event) else {
            self.errors.push(DeclarationError::UnknownEvent(name));
            return self;
        };
        match slot {
            Slot::State(state) => definition.by_state.entry(state).or_default().extend(activities),
            Slot::Any => definition.during_any.get_or_insert_with(Vec::new).extend(activities),
        }
        self
    }

    fn definition_mut<T: Message>(&mut self, event: &Event<T>) -> Option<&mut EventDefinition<D, T>> {
        self.events
            .get_mut(event.name())?
            .as_any_mut()
            .downcast_mut::<EventDefinition<D, T>>()
    }

    fn is_declared(&self, state: &State) -> bool {
        state.is_reserved() || self.states.contains(state)
    }
}

/// An immutable, declared state machine.
///
/// Shared freely between threads; all per-instance data lives in the
/// [`SagaInstance`] passed to [`StateMachine::raise`].
pub struct StateMachine<D> {
    name: String,
    states: Vec<State>,
    events: HashMap<EventName, Box<dyn ErasedEvent<D>>>,
    event_order: Vec<EventName>,
    completion: Completion<D>,
}

impl<D: SagaData> StateMachine<D> {
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder<D> {
        StateMachineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Initial`, the declared states in declaration order, then `Final`.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn events(&self) -> impl Iterator<Item = &EventName> {
        self.event_order.iter()
    }

    /// Correlation rule of every declared event, in declaration order.
    pub fn correlations(&self) -> Vec<CorrelationInfo> {
        self.event_order
            .iter()
            .filter_map(|name| self.events.get(name))
            .map(|definition| definition.correlation_info())
            .collect()
    }

    pub fn correlation_for(&self, event: &EventName) -> Option<CorrelationInfo> {
        self.events.get(event).map(|definition| definition.correlation_info())
    }

    pub fn declaration_table(&self) -> DeclarationTable {
        DeclarationTable {
            machine: self.name.clone(),
            states: self.states.clone(),
            events: self
                .event_order
                .iter()
                .filter_map(|name| self.events.get(name))
                .map(|definition| definition.summary())
                .collect(),
            correlations: self.correlations(),
        }
    }

    /// Whether raising `event` in `state` would be accepted (possibly as ignored).
    pub fn accepts(&self, state: &State, event: &EventName) -> bool {
        let Some(summary) = self.events.get(event).map(|definition| definition.summary()) else {
            return false;
        };
        if let Some(received) = &summary.forwards_to {
            return self.accepts(state, received);
        }
        summary.states.contains(state)
            || summary.ignored_in.contains(state)
            || (!state.is_initial() && (summary.during_any || summary.housekeeping))
    }

    pub fn is_completed(&self, instance: &SagaInstance<D>) -> bool {
        match &self.completion {
            Completion::Never => false,
            Completion::WhenFinalized => instance.current_state().is_final(),
            Completion::Custom(predicate) => predicate(instance),
        }
    }

    /// Correlate a delivery according to the event's declared rule.
    pub fn resolve<T: Message>(
        &self,
        event: &Event<T>,
        ctx: &ConsumeContext<T>,
    ) -> Result<CorrelationTarget<D>, MachineError> {
        Ok(self.definition(event.name())?.strategy.resolve(ctx))
    }

    /// Whether a missing instance should be created for this delivery.
    pub fn should_initiate<T: Message>(&self, event: &Event<T>, ctx: &ConsumeContext<T>) -> Result<bool, MachineError> {
        Ok(self.definition(event.name())?.missing_policy().should_initiate(ctx))
    }

    /// Evaluate the event's correlation filter, if any, against a loaded instance.
    pub fn filter_accepts<T: Message>(
        &self,
        event: &Event<T>,
        instance: &SagaInstance<D>,
        ctx: &ConsumeContext<T>,
    ) -> Result<bool, MachineError> {
        let definition = self.definition(event.name())?;
        Ok(definition.filter.as_ref().is_none_or(|filter| filter(instance, ctx)))
    }

    /// Raise `event` against `instance`.
    ///
    /// On success the instance reflects the transition and the returned
    /// [`Transition`] carries the buffered outbox. On error the instance may
    /// hold partial changes and must not be persisted.
    pub fn raise<T: Message>(
        &self,
        event: &Event<T>,
        instance: &mut SagaInstance<D>,
        ctx: &ConsumeContext<T>,
        scheduler: &dyn MessageScheduler,
    ) -> Result<Transition, MachineError> {
        let definition = self.definition(event.name())?;
        self.raise_definition(definition, instance, ctx, scheduler)
    }

    fn raise_definition<T: Message>(
        &self,
        definition: &EventDefinition<D, T>,
        instance: &mut SagaInstance<D>,
        ctx: &ConsumeContext<T>,
        scheduler: &dyn MessageScheduler,
    ) -> Result<Transition, MachineError> {
        let from = instance.current_state().clone();

        if let Some(gate) = &definition.gate {
            let stored = instance.schedule_token(&gate.schedule);
            if let Some(delivered) = ctx.scheduling_token() {
                if stored != Some(delivered) {
                    debug!(
                        machine = %self.name,
                        correlation_id = %instance.correlation_id(),
                        schedule = %gate.schedule,
                        token = %delivered,
                        "stale scheduled message dropped"
                    );
                    return Ok(Transition::unchanged(definition.name.clone(), from, Disposition::Stale));
                }
            }
            let received = self.definition::<T>(&gate.received)?;
            let transition = self.raise_definition(received, instance, ctx, scheduler)?;
            if instance.schedule_token(&gate.schedule) == stored {
                instance.set_schedule_token(&gate.schedule, None);
            }
            return Ok(transition);
        }

        let housekeeping: &[ActivityRef<D, T>] = if from.is_initial() {
            &[]
        } else {
            &definition.housekeeping
        };
        let behavior = match definition.by_state.get(&from) {
            Some(behavior) => Some(behavior),
            None if definition.ignored.contains(&from) => {
                if housekeeping.is_empty() {
                    debug!(
                        machine = %self.name,
                        correlation_id = %instance.correlation_id(),
                        event = %definition.name,
                        state = %from,
                        "event ignored"
                    );
                    return Ok(Transition::unchanged(definition.name.clone(), from, Disposition::Ignored));
                }
                None
            }
            None if !from.is_initial() => definition.during_any.as_ref(),
            None => None,
        };

        if behavior.is_none() && housekeeping.is_empty() {
            return Err(MachineError::NotAccepted {
                event: definition.name.clone(),
                state: from,
                correlation_id: instance.correlation_id(),
            });
        }

        let outbox = {
            let mut behavior_ctx = BehaviorContext::new(instance, ctx, &definition.name, scheduler);
            run_all(housekeeping, &mut behavior_ctx)
                .and_then(|()| match behavior {
                    Some(activities) => run_all(activities, &mut behavior_ctx),
                    None => Ok(()),
                })
                .map_err(|fault| fault_error(&definition.name, fault))?;
            behavior_ctx.into_outbox()
        };

        let to = instance.current_state().clone();
        debug!(
            machine = %self.name,
            correlation_id = %instance.correlation_id(),
            event = %definition.name,
            from = %from,
            to = %to,
            outbox = outbox.len(),
            "event raised"
        );
        Ok(Transition {
            event: definition.name.clone(),
            from,
            to,
            disposition: Disposition::Accepted,
            outbox,
        })
    }

    fn definition<T: Message>(&self, name: &EventName) -> Result<&EventDefinition<D, T>, MachineError> {
        self.events
            .get(name)
            .and_then(|definition| definition.as_any().downcast_ref::<EventDefinition<D, T>>())
            .ok_or_else(|| MachineError::UnknownEvent(name.clone()))
    }
}

impl<D> core::fmt::Debug for StateMachine<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("events", &self.event_order)
            .finish_non_exhaustive()
    }
}

fn fault_error(event: &EventName, fault: Fault) -> MachineError {
    if fault.is(&FaultKind::SCHEDULER) {
        MachineError::Scheduler {
            event: event.clone(),
            message: fault.message().to_string(),
        }
    } else {
        MachineError::Fault {
            event: event.clone(),
            fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use sagaflow_core::{CorrelationId, RequestId, TokenId};

    use super::*;
    use crate::bus::Destination;
    use crate::correlation::{CorrelationKind, MissingKind};
    use crate::scheduler::InMemoryScheduler;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Submitted {
        order_id: CorrelationId,
        amount: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Cancelled {
        order_id: CorrelationId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        order_id: CorrelationId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentRequested {
        amount: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentApproved {
        approval: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Reminder {
        order_id: CorrelationId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Audit {
        subject: Option<CorrelationId>,
    }

    macro_rules! message {
        ($t:ty, $name:literal) => {
            impl Message for $t {
                fn message_type() -> &'static str {
                    $name
                }
            }
        };
        ($t:ty, $name:literal, correlated) => {
            message!($t, $name);

            impl CorrelatedBy for $t {
                fn correlation_id(&self) -> CorrelationId {
                    self.order_id
                }
            }
        };
    }

    message!(Submitted, "test.submitted", correlated);
    message!(Cancelled, "test.cancelled", correlated);
    message!(Ping, "test.ping", correlated);
    message!(Reminder, "test.reminder", correlated);
    message!(PaymentRequested, "test.payment_requested");
    message!(PaymentApproved, "test.payment_approved");
    message!(Audit, "test.audit");

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Order {
        amount: u32,
        pings: u32,
        approval: Option<String>,
        reminders: u32,
        failures: u32,
    }

    const DECLINED: FaultKind = FaultKind::from_static("test.declined");

    struct Fixture {
        machine: StateMachine<Order>,
        running: State,
        failed: State,
        submitted: Event<Submitted>,
        cancelled: Event<Cancelled>,
        ping: Event<Ping>,
        payment: Request<PaymentRequested, PaymentApproved>,
        reminder: Schedule<Reminder>,
    }

    fn fixture() -> Fixture {
        let mut b = StateMachine::<Order>::builder("orders");
        let running = b.state("Running");
        let failed = b.state("Failed");
        let submitted = b.correlated_event::<Submitted>("Submitted");
        let cancelled = b.correlated_event::<Cancelled>("Cancelled");
        let ping = b.correlated_event::<Ping>("Ping");
        let payment = b.request::<PaymentRequested, PaymentApproved>(
            "Payment",
            RequestSettings::send_to("payments").with_timeout(Duration::from_secs(30)),
        );
        let reminder = b.schedule::<Reminder, _>("Reminder", ScheduleSettings::after(Duration::from_secs(60)), |c| {
            c.by_identity()
        });

        b.initially(
            b.when(&submitted)
                .then(|ctx| {
                    if ctx.message().amount > 1_000 {
                        return Err(Fault::new(DECLINED, "amount too large"));
                    }
                    ctx.data_mut().amount = ctx.message().amount;
                    Ok(())
                })
                .request(&payment, |ctx| Ok(PaymentRequested { amount: ctx.data().amount }))
                .schedule(&reminder, |ctx| Ok(Reminder { order_id: ctx.correlation_id() }))
                .transition_to(payment.pending()),
        );
        b.during(
            &[payment.pending()],
            b.when(payment.completed())
                .then(|ctx| {
                    ctx.data_mut().approval = Some(ctx.message().approval.clone());
                    Ok(())
                })
                .transition_to(&running),
        );
        b.during(&[payment.pending()], b.when(payment.faulted()).transition_to(&failed));
        b.during(&[payment.pending()], b.when(payment.timeout_expired()).transition_to(&failed));
        b.during(
            &[payment.pending(), &running],
            b.when(reminder.received()).then(|ctx| {
                ctx.data_mut().reminders += 1;
                Ok(())
            }),
        );
        b.during(&[&running], b.when(&cancelled).unschedule(&reminder).finalize());
        b.ignore(&[&failed], &cancelled);
        b.during_any(b.when(&ping).then(|ctx| {
            ctx.data_mut().pings += 1;
            Ok(())
        }));
        b.during(
            &[&running],
            b.when(&ping).then(|ctx| {
                ctx.data_mut().pings += 10;
                Ok(())
            }),
        );
        b.set_completed_when_finalized();

        Fixture {
            machine: b.build().unwrap(),
            running,
            failed,
            submitted,
            cancelled,
            ping,
            payment,
            reminder,
        }
    }

    fn submit(f: &Fixture, scheduler: &InMemoryScheduler, amount: u32) -> SagaInstance<Order> {
        let id = CorrelationId::new();
        let mut instance = SagaInstance::new(id, Order::default());
        f.machine
            .raise(
                &f.submitted,
                &mut instance,
                &ConsumeContext::new(Submitted { order_id: id, amount }),
                scheduler,
            )
            .unwrap();
        instance
    }

    fn in_state(state: &State) -> SagaInstance<Order> {
        let mut instance = SagaInstance::new(CorrelationId::new(), Order::default());
        instance.set_current_state(state.clone());
        instance
    }

    #[test]
    fn initial_event_runs_activities_in_order() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let instance = submit(&f, &scheduler, 40);

        assert_eq!(instance.current_state(), f.payment.pending());
        assert_eq!(instance.data().amount, 40);
        assert!(instance.request_id("Payment").is_some());
        assert!(instance.schedule_token("Reminder").is_some());
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn exact_entry_wins_over_during_any() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = in_state(&f.running);
        let ctx = ConsumeContext::new(Ping {
            order_id: instance.correlation_id(),
        });

        f.machine.raise(&f.ping, &mut instance, &ctx, &scheduler).unwrap();
        assert_eq!(instance.data().pings, 10);

        let mut failed = in_state(&f.failed);
        f.machine.raise(&f.ping, &mut failed, &ctx, &scheduler).unwrap();
        assert_eq!(failed.data().pings, 1);
    }

    #[test]
    fn during_any_does_not_apply_to_initial() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = SagaInstance::new(CorrelationId::new(), Order::default());
        let ctx = ConsumeContext::new(Ping {
            order_id: instance.correlation_id(),
        });

        let err = f.machine.raise(&f.ping, &mut instance, &ctx, &scheduler).unwrap_err();
        assert!(err.is_not_accepted());
        assert!(instance.current_state().is_initial());
    }

    #[test]
    fn unbound_event_is_not_accepted_and_state_is_unchanged() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 10);
        let before = instance.clone();
        let id = instance.correlation_id();

        let err = f
            .machine
            .raise(
                &f.cancelled,
                &mut instance,
                &ConsumeContext::new(Cancelled { order_id: id }),
                &scheduler,
            )
            .unwrap_err();

        match err {
            MachineError::NotAccepted { event, state, .. } => {
                assert_eq!(event.as_str(), "Cancelled");
                assert_eq!(&state, f.payment.pending());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(instance, before);
        assert!(!f.machine.accepts(f.payment.pending(), f.cancelled.name()));
    }

    #[test]
    fn ignored_event_is_accepted_without_effects() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = in_state(&f.failed);
        let id = instance.correlation_id();
        let transition = f
            .machine
            .raise(
                &f.cancelled,
                &mut instance,
                &ConsumeContext::new(Cancelled { order_id: id }),
                &scheduler,
            )
            .unwrap();

        assert_eq!(transition.disposition, Disposition::Ignored);
        assert_eq!(instance.current_state(), &f.failed);
        assert!(f.machine.accepts(&f.failed, f.cancelled.name()));
    }

    #[test]
    fn finalize_marks_instance_completed() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = in_state(&f.running);
        assert!(!f.machine.is_completed(&instance));
        let id = instance.correlation_id();

        f.machine
            .raise(
                &f.cancelled,
                &mut instance,
                &ConsumeContext::new(Cancelled { order_id: id }),
                &scheduler,
            )
            .unwrap();

        assert!(instance.current_state().is_final());
        assert!(f.machine.is_completed(&instance));
    }

    #[test]
    fn request_completion_clears_slot_and_cancels_timeout() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let request_id = instance.request_id("Payment").unwrap();
        assert!(scheduler.contains(TokenId::from(request_id)));

        let response = ConsumeContext::new(PaymentApproved {
            approval: "A-1".into(),
        })
        .with_request_id(request_id);

        match f.machine.resolve(f.payment.completed(), &response).unwrap() {
            CorrelationTarget::Query(query) => {
                assert!(query.matches(&instance));
                assert_eq!(query.hint(), Some(sagaflow_core::QueryHint::PendingRequest(request_id)));
            }
            other => panic!("unexpected target: {other:?}"),
        }

        let transition = f
            .machine
            .raise(f.payment.completed(), &mut instance, &response, &scheduler)
            .unwrap();
        assert_eq!(transition.to, f.running);
        assert_eq!(instance.request_id("Payment"), None);
        assert!(!scheduler.contains(TokenId::from(request_id)));
        assert_eq!(instance.data().approval.as_deref(), Some("A-1"));

        // A duplicate response still reaches the engine, but cleanup is inert.
        let again = f
            .machine
            .raise(f.payment.completed(), &mut instance, &response, &scheduler)
            .unwrap();
        assert_eq!(again.to, f.running);
        assert_eq!(instance.request_id("Payment"), None);
    }

    #[test]
    fn request_is_sent_with_headers() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let id = CorrelationId::new();
        let mut instance = SagaInstance::new(id, Order::default());
        let transition = f
            .machine
            .raise(
                &f.submitted,
                &mut instance,
                &ConsumeContext::new(Submitted { order_id: id, amount: 7 }),
                &scheduler,
            )
            .unwrap();

        assert_eq!(transition.outbox.len(), 1);
        let sent = &transition.outbox[0];
        assert!(sent.is_type::<PaymentRequested>());
        assert_eq!(
            sent.destination,
            Destination::Send {
                address: "payments".into()
            }
        );
        assert_eq!(sent.correlation_id, Some(id));
        assert_eq!(sent.request_id, instance.request_id("Payment"));
    }

    #[test]
    fn request_timeout_moves_to_failed() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let request_id = instance.request_id("Payment").unwrap();

        let timeout = scheduler
            .pending()
            .into_iter()
            .find(|m| m.token == TokenId::from(request_id))
            .unwrap();
        let ctx = timeout
            .message
            .to_consume_context::<RequestTimeoutExpired<PaymentRequested>>()
            .unwrap();
        assert_eq!(ctx.message().request.amount, 25);

        f.machine
            .raise(f.payment.timeout_expired(), &mut instance, &ctx, &scheduler)
            .unwrap();
        assert_eq!(instance.current_state(), &f.failed);
        assert_eq!(instance.request_id("Payment"), None);
    }

    #[test]
    fn faulted_response_clears_only_its_own_request() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let request_id = instance.request_id("Payment").unwrap();

        // No request-id header: the fault body names the request.
        let fault = ConsumeContext::new(RequestFault {
            request_id,
            kind: "payments.declined".into(),
            message: "card declined".into(),
            request: PaymentRequested { amount: 25 },
            occurred_at: Utc::now(),
        });
        f.machine
            .raise(f.payment.faulted(), &mut instance, &fault, &scheduler)
            .unwrap();
        assert_eq!(instance.current_state(), &f.failed);
        assert_eq!(instance.request_id("Payment"), None);
        assert!(!scheduler.contains(TokenId::from(request_id)));

        // A newer request is pending; the duplicate fault must leave it alone.
        let newer = RequestId::new();
        instance.set_request_id("Payment", Some(newer));
        instance.set_current_state(f.payment.pending().clone());
        f.machine
            .raise(f.payment.faulted(), &mut instance, &fault, &scheduler)
            .unwrap();
        assert_eq!(instance.request_id("Payment"), Some(newer));
    }

    #[test]
    fn duplicate_timeout_keeps_a_newer_pending_request() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let request_id = instance.request_id("Payment").unwrap();
        let expired = ConsumeContext::new(RequestTimeoutExpired {
            correlation_id: instance.correlation_id(),
            request_id,
            expired_at: Utc::now(),
            request: PaymentRequested { amount: 25 },
        });

        f.machine
            .raise(f.payment.timeout_expired(), &mut instance, &expired, &scheduler)
            .unwrap();
        assert_eq!(instance.request_id("Payment"), None);

        let newer = RequestId::new();
        instance.set_request_id("Payment", Some(newer));
        instance.set_current_state(f.payment.pending().clone());
        f.machine
            .raise(f.payment.timeout_expired(), &mut instance, &expired, &scheduler)
            .unwrap();
        assert_eq!(instance.request_id("Payment"), Some(newer));
    }

    #[test]
    fn stale_schedule_token_is_dropped() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let current = instance.schedule_token("Reminder").unwrap();

        let stale = ConsumeContext::new(Reminder {
            order_id: instance.correlation_id(),
        })
        .with_scheduling_token(TokenId::new());
        let transition = f
            .machine
            .raise(f.reminder.any_received(), &mut instance, &stale, &scheduler)
            .unwrap();

        assert_eq!(transition.disposition, Disposition::Stale);
        assert_eq!(instance.data().reminders, 0);
        assert_eq!(instance.schedule_token("Reminder"), Some(current));
    }

    #[test]
    fn current_schedule_token_raises_received_and_clears_slot() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let token = instance.schedule_token("Reminder").unwrap();

        let delivered = scheduler
            .pending()
            .into_iter()
            .find(|m| m.token == token)
            .unwrap()
            .message
            .to_consume_context::<Reminder>()
            .unwrap();
        let transition = f
            .machine
            .raise(f.reminder.any_received(), &mut instance, &delivered, &scheduler)
            .unwrap();

        assert!(transition.is_accepted());
        assert_eq!(instance.data().reminders, 1);
        assert_eq!(instance.schedule_token("Reminder"), None);

        // Redelivery of the same message after the slot was cleared is stale.
        let replay = f
            .machine
            .raise(f.reminder.any_received(), &mut instance, &delivered, &scheduler)
            .unwrap();
        assert_eq!(replay.disposition, Disposition::Stale);
        assert_eq!(instance.data().reminders, 1);
    }

    #[test]
    fn unschedule_cancels_outstanding_message() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let mut instance = submit(&f, &scheduler, 25);
        let token = instance.schedule_token("Reminder").unwrap();
        instance.set_current_state(f.running.clone());
        let id = instance.correlation_id();

        f.machine
            .raise(
                &f.cancelled,
                &mut instance,
                &ConsumeContext::new(Cancelled { order_id: id }),
                &scheduler,
            )
            .unwrap();
        assert!(!scheduler.contains(token));
        assert_eq!(instance.schedule_token("Reminder"), None);
    }

    #[test]
    fn uncaught_fault_is_reported() {
        let f = fixture();
        let scheduler = InMemoryScheduler::new();
        let id = CorrelationId::new();
        let mut instance = SagaInstance::new(id, Order::default());
        let err = f
            .machine
            .raise(
                &f.submitted,
                &mut instance,
                &ConsumeContext::new(Submitted {
                    order_id: id,
                    amount: 5_000,
                }),
                &scheduler,
            )
            .unwrap_err();

        match err {
            MachineError::Fault { fault, .. } => assert!(fault.is(&DECLINED)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(scheduler.is_empty());
    }

    #[test]
    fn catch_redirects_and_processing_continues() {
        let mut b = StateMachine::<Order>::builder("catching");
        let accepted = b.state("Accepted");
        let rejected = b.state("Rejected");
        let submitted = b.correlated_event::<Submitted>("Submitted");
        b.initially(
            b.when(&submitted)
                .then(|ctx| {
                    if ctx.message().amount > 100 {
                        Err(Fault::new(DECLINED, "over limit"))
                    } else {
                        Ok(())
                    }
                })
                .transition_to(&accepted)
                .catch(DECLINED, |handler| {
                    handler
                        .then(|ctx| {
                            ctx.data_mut().failures += 1;
                            Ok(())
                        })
                        .transition_to(&rejected)
                }),
        );
        let machine = b.build().unwrap();
        let scheduler = InMemoryScheduler::new();

        let id = CorrelationId::new();
        let mut large = SagaInstance::new(id, Order::default());
        let transition = machine
            .raise(
                &submitted,
                &mut large,
                &ConsumeContext::new(Submitted { order_id: id, amount: 500 }),
                &scheduler,
            )
            .unwrap();
        assert!(transition.is_accepted());
        assert_eq!(large.current_state(), &rejected);
        assert_eq!(large.data().failures, 1);

        let mut small = SagaInstance::new(id, Order::default());
        machine
            .raise(
                &submitted,
                &mut small,
                &ConsumeContext::new(Submitted { order_id: id, amount: 5 }),
                &scheduler,
            )
            .unwrap();
        assert_eq!(small.current_state(), &accepted);
    }

    #[test]
    fn correlations_are_enumerable() {
        fn audit_subject(audit: &Audit) -> Option<CorrelationId> {
            audit.subject
        }

        let mut conventions = CorrelationConventions::new();
        conventions.register::<Audit>(audit_subject);

        let mut b = StateMachine::<Order>::builder("correlations").with_conventions(conventions);
        let open = b.state("Open");
        let submitted = b.correlated_event::<Submitted>("Submitted");
        let audit = b.event::<Audit>("Audited");
        let untracked = b.event::<PaymentApproved>("Untracked");
        b.initially(b.when(&submitted).transition_to(&open));
        b.during(&[&open], b.when(&audit));
        b.during(&[&open], b.when(&untracked));
        let machine = b.build().unwrap();

        let kinds: Vec<_> = machine.correlations().into_iter().map(|c| (c.event.to_string(), c.kind, c.missing)).collect();
        assert_eq!(
            kinds,
            vec![
                ("Submitted".to_string(), CorrelationKind::Identity, MissingKind::Initiate),
                ("Audited".to_string(), CorrelationKind::Convention, MissingKind::Discard),
                ("Untracked".to_string(), CorrelationKind::Uncorrelated, MissingKind::Discard),
            ]
        );

        let ctx = ConsumeContext::new(Audit { subject: None });
        assert!(matches!(machine.resolve(&audit, &ctx).unwrap(), CorrelationTarget::Unresolved));
        let ctx = ConsumeContext::new(PaymentApproved { approval: "x".into() });
        assert!(matches!(
            machine.resolve(&untracked, &ctx).unwrap(),
            CorrelationTarget::Uncorrelated
        ));
    }

    #[test]
    fn declaration_table_serializes() {
        let f = fixture();
        let table = f.machine.declaration_table();
        assert_eq!(table.states.first(), Some(&State::INITIAL));
        assert_eq!(table.states.last(), Some(&State::FINAL));
        assert!(table.states.contains(f.payment.pending()));

        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["machine"], "orders");
        let any_received = table
            .events
            .iter()
            .find(|e| e.event == *f.reminder.any_received().name())
            .unwrap();
        assert_eq!(any_received.forwards_to.as_ref(), Some(f.reminder.received().name()));
    }

    #[test]
    fn undeclared_target_state_fails_the_build() {
        let mut b = StateMachine::<Order>::builder("broken");
        let submitted = b.correlated_event::<Submitted>("Submitted");
        let ghost = State::new("Ghost").unwrap();
        b.initially(b.when(&submitted).transition_to(&ghost));

        let err = b.build().unwrap_err();
        assert!(matches!(
            err,
            MachineError::Declaration(DeclarationError::UndeclaredState { ref state, .. }) if state == "Ghost"
        ));
    }

    #[test]
    fn initiate_requires_an_initial_binding() {
        let mut b = StateMachine::<Order>::builder("broken");
        let open = b.state("Open");
        let cancelled = b.event_with::<Cancelled, _>("Cancelled", |c| c.by_identity().on_missing(NotFoundPolicy::Initiate));
        b.during(&[&open], b.when(&cancelled).finalize());

        assert!(matches!(
            b.build(),
            Err(MachineError::Declaration(DeclarationError::InitiateWithoutInitialBinding(_)))
        ));
    }

    #[test]
    fn duplicate_names_fail_the_build() {
        let mut b = StateMachine::<Order>::builder("broken");
        b.state("Open");
        b.state("Open");
        assert!(matches!(
            b.build(),
            Err(MachineError::Declaration(DeclarationError::DuplicateState(_)))
        ));

        let mut b = StateMachine::<Order>::builder("broken");
        b.correlated_event::<Submitted>("Submitted");
        b.correlated_event::<Submitted>("Submitted");
        assert!(matches!(
            b.build(),
            Err(MachineError::Declaration(DeclarationError::DuplicateEvent(_)))
        ));
    }

    #[test]
    fn missing_instance_policy_follows_initial_binding() {
        let f = fixture();
        let ctx = ConsumeContext::new(Submitted {
            order_id: CorrelationId::new(),
            amount: 1,
        });
        assert!(f.machine.should_initiate(&f.submitted, &ctx).unwrap());

        let ctx = ConsumeContext::new(Cancelled {
            order_id: CorrelationId::new(),
        });
        assert!(!f.machine.should_initiate(&f.cancelled, &ctx).unwrap());
    }
}
