//! Fluent behavior builder: `when(&event).then(..).transition_to(&state)`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use sagaflow_core::{Fault, FaultKind, State};

use crate::activity::{Activity, ActivityRef, BehaviorContext, Catch, FaultMatcher, Then, TransitionTo};
use crate::event::Event;
use crate::message::Message;
use crate::request::{Request, SendRequest};
use crate::schedule::{Schedule, ScheduleMessage, Unschedule};

/// Start a behavior for `event`.
pub fn when<D, T>(event: &Event<T>) -> EventActivities<D, T> {
    EventActivities {
        event: event.clone(),
        activities: Vec::new(),
        targets: Vec::new(),
    }
}

/// The ordered activities bound to one event, before they are attached to states.
pub struct EventActivities<D, T> {
    event: Event<T>,
    activities: Vec<ActivityRef<D, T>>,
    targets: Vec<State>,
}

impl<D, T> EventActivities<D, T>
where
    D: Send + Sync + 'static,
    T: Message,
{
    pub fn event(&self) -> &Event<T> {
        &self.event
    }

    /// Append a custom activity.
    pub fn activity(mut self, activity: impl Activity<D, T> + 'static) -> Self {
        self.activities.push(Arc::new(activity));
        self
    }

    pub fn then<F>(self, f: F) -> Self
    where
        F: Fn(&mut BehaviorContext<'_, D, T>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.activity(Then(f))
    }

    pub fn transition_to(mut self, state: &State) -> Self {
        self.targets.push(state.clone());
        self.activity(TransitionTo(state.clone()))
    }

    pub fn finalize(self) -> Self {
        self.transition_to(&State::FINAL)
    }

    /// Publish the message built by `build` once the instance is persisted.
    pub fn publish<M, F>(self, build: F) -> Self
    where
        M: Message,
        F: Fn(&BehaviorContext<'_, D, T>) -> M + Send + Sync + 'static,
    {
        self.then(move |ctx| {
            let message = build(ctx);
            ctx.publish(&message)
        })
    }

    /// Send the message built by `build` to `address` once the instance is persisted.
    pub fn send<M, F>(self, address: impl Into<String>, build: F) -> Self
    where
        M: Message,
        F: Fn(&BehaviorContext<'_, D, T>) -> M + Send + Sync + 'static,
    {
        let address = address.into();
        self.then(move |ctx| {
            let message = build(ctx);
            ctx.send(&address, &message)
        })
    }

    /// Send a request and record it as pending. Transition to
    /// `request.pending()` explicitly if the saga should wait.
    pub fn request<Req, Resp, F>(self, request: &Request<Req, Resp>, build: F) -> Self
    where
        Req: Message,
        F: Fn(&BehaviorContext<'_, D, T>) -> Result<Req, Fault> + Send + Sync + 'static,
    {
        self.activity(SendRequest::new(
            request.name().to_string(),
            request.settings().clone(),
            Arc::new(build),
        ))
    }

    /// Schedule a message after the schedule's configured delay.
    pub fn schedule<M, F>(self, schedule: &Schedule<M>, build: F) -> Self
    where
        M: Message,
        F: Fn(&BehaviorContext<'_, D, T>) -> Result<M, Fault> + Send + Sync + 'static,
    {
        self.activity(ScheduleMessage::new(
            schedule.name().to_string(),
            schedule.settings().clone(),
            Arc::new(build),
            None,
        ))
    }

    /// Schedule a message for an explicit delivery time.
    pub fn schedule_at<M, A, F>(self, schedule: &Schedule<M>, at: A, build: F) -> Self
    where
        M: Message,
        A: Fn(&BehaviorContext<'_, D, T>) -> DateTime<Utc> + Send + Sync + 'static,
        F: Fn(&BehaviorContext<'_, D, T>) -> Result<M, Fault> + Send + Sync + 'static,
    {
        self.activity(ScheduleMessage::new(
            schedule.name().to_string(),
            schedule.settings().clone(),
            Arc::new(build),
            Some(Arc::new(at)),
        ))
    }

    pub fn unschedule<M>(self, schedule: &Schedule<M>) -> Self {
        self.activity(Unschedule::new(schedule.name().to_string()))
    }

    /// Wrap every activity declared so far; a fault of `kind` runs `handler` instead
    /// of failing the message.
    pub fn catch<H>(self, kind: impl Into<FaultKind>, handler: H) -> Self
    where
        H: FnOnce(EventActivities<D, T>) -> EventActivities<D, T>,
    {
        self.wrap(FaultMatcher::Kind(kind.into()), handler)
    }

    /// Like [`EventActivities::catch`], for every fault kind.
    pub fn catch_any<H>(self, handler: H) -> Self
    where
        H: FnOnce(EventActivities<D, T>) -> EventActivities<D, T>,
    {
        self.wrap(FaultMatcher::Any, handler)
    }

    fn wrap<H>(mut self, matcher: FaultMatcher, handler: H) -> Self
    where
        H: FnOnce(EventActivities<D, T>) -> EventActivities<D, T>,
    {
        let handler = handler(when(&self.event));
        self.targets.extend(handler.targets);
        let body = std::mem::take(&mut self.activities);
        self.activities.push(Arc::new(Catch {
            body,
            matcher,
            handler: handler.activities,
        }));
        self
    }

    pub(crate) fn into_parts(self) -> (Event<T>, Vec<ActivityRef<D, T>>, Vec<State>) {
        (self.event, self.activities, self.targets)
    }
}

impl<D, T> Clone for EventActivities<D, T> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            activities: self.activities.clone(),
            targets: self.targets.clone(),
        }
    }
}

impl<D, T> core::fmt::Debug for EventActivities<D, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventActivities")
            .field("event", self.event.name())
            .field("activities", &self.activities.len())
            .field("targets", &self.targets)
            .finish()
    }
}
