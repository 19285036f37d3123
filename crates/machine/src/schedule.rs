//! Schedule sub-protocol: deferred messages a saga sends to itself.
//!
//! A schedule owns two events for its message type. `<name>.AnyReceived` is
//! the one correlated and dispatched; it compares the delivered scheduling
//! token with the one stored in the instance. A mismatch means the message was
//! superseded or cancelled and it is dropped. A match raises
//! `<name>.Received`, which is what user behaviors bind to, and then clears
//! the slot unless those behaviors scheduled again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use sagaflow_core::Fault;

use crate::activity::{Activity, BehaviorContext};
use crate::bus::OutboundMessage;
use crate::event::{Event, EventName};
use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Delay used when no explicit delivery time is given.
    pub delay: Duration,
}

impl ScheduleSettings {
    pub fn after(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Handle to a declared schedule.
pub struct Schedule<M> {
    name: String,
    settings: ScheduleSettings,
    received: Event<M>,
    any_received: Event<M>,
}

impl<M> Schedule<M> {
    pub(crate) fn new(name: String, settings: ScheduleSettings, received: Event<M>, any_received: Event<M>) -> Self {
        Self {
            name,
            settings,
            received,
            any_received,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    /// Raised for current deliveries only; bind user behaviors here.
    pub fn received(&self) -> &Event<M> {
        &self.received
    }

    /// The event scheduled messages are dispatched to.
    pub fn any_received(&self) -> &Event<M> {
        &self.any_received
    }
}

impl<M> Clone for Schedule<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            settings: self.settings.clone(),
            received: self.received.clone(),
            any_received: self.any_received.clone(),
        }
    }
}

impl<M> core::fmt::Debug for Schedule<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Schedule")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Token check wired in front of a schedule's `AnyReceived` event.
#[derive(Debug, Clone)]
pub(crate) struct ScheduleGate {
    pub(crate) schedule: String,
    pub(crate) received: EventName,
}

pub(crate) type MessageBuilder<D, T, M> = Arc<dyn Fn(&BehaviorContext<'_, D, T>) -> Result<M, Fault> + Send + Sync>;
pub(crate) type DeliveryTime<D, T> = Arc<dyn Fn(&BehaviorContext<'_, D, T>) -> DateTime<Utc> + Send + Sync>;

/// Schedules the message, replacing (and cancelling) any outstanding one.
pub(crate) struct ScheduleMessage<D, T, M> {
    name: String,
    settings: ScheduleSettings,
    build: MessageBuilder<D, T, M>,
    at: Option<DeliveryTime<D, T>>,
}

impl<D, T, M> ScheduleMessage<D, T, M> {
    pub(crate) fn new(
        name: String,
        settings: ScheduleSettings,
        build: MessageBuilder<D, T, M>,
        at: Option<DeliveryTime<D, T>>,
    ) -> Self {
        Self {
            name,
            settings,
            build,
            at,
        }
    }
}

impl<D, T, M> Activity<D, T> for ScheduleMessage<D, T, M>
where
    M: Message,
{
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        let message = (self.build)(ctx)?;
        let deliver_at = match &self.at {
            Some(at) => at(ctx),
            None => Utc::now() + chrono::Duration::from_std(self.settings.delay).map_err(Fault::scheduler)?,
        };

        if let Some(previous) = ctx.instance().schedule_token(&self.name) {
            ctx.scheduler().cancel(previous).map_err(Fault::scheduler)?;
        }

        let outbound = OutboundMessage::publish(&message)
            .map_err(Fault::serialization)?
            .with_correlation_id(ctx.correlation_id());
        let token = ctx
            .scheduler()
            .schedule_at(deliver_at, outbound)
            .map_err(Fault::scheduler)?;
        ctx.instance_mut().set_schedule_token(&self.name, Some(token));

        debug!(
            correlation_id = %ctx.correlation_id(),
            schedule = %self.name,
            token = %token,
            deliver_at = %deliver_at,
            "message scheduled"
        );
        Ok(())
    }
}

/// Cancels the outstanding message, if any, and clears the slot.
pub(crate) struct Unschedule {
    name: String,
}

impl Unschedule {
    pub(crate) fn new(name: String) -> Self {
        Self { name }
    }
}

impl<D, T> Activity<D, T> for Unschedule {
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        if let Some(token) = ctx.instance().schedule_token(&self.name) {
            ctx.scheduler().cancel(token).map_err(Fault::scheduler)?;
            ctx.instance_mut().set_schedule_token(&self.name, None);
            debug!(correlation_id = %ctx.correlation_id(), schedule = %self.name, token = %token, "message unscheduled");
        }
        Ok(())
    }
}
