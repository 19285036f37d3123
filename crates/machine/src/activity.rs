//! Activities: the units of work a transition executes.

use std::sync::Arc;

use tracing::debug;

use sagaflow_core::{CorrelationId, Fault, FaultKind, SagaInstance, State};

use crate::bus::OutboundMessage;
use crate::context::ConsumeContext;
use crate::event::EventName;
use crate::message::Message;
use crate::scheduler::MessageScheduler;

/// One step of a behavior.
///
/// Activities run sequentially in declaration order. Returning a fault stops
/// the remaining activities unless an enclosing `catch` handles it.
pub trait Activity<D, T>: Send + Sync {
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault>;
}

pub type ActivityRef<D, T> = Arc<dyn Activity<D, T>>;

/// What an activity sees while an event is being raised.
///
/// Outbound messages are buffered here; the dispatch pipeline publishes them
/// once the instance has been persisted. Scheduler calls go out immediately.
pub struct BehaviorContext<'a, D, T> {
    instance: &'a mut SagaInstance<D>,
    consume: &'a ConsumeContext<T>,
    event: &'a EventName,
    scheduler: &'a dyn MessageScheduler,
    outbox: Vec<OutboundMessage>,
    caught: Option<Fault>,
}

impl<'a, D, T> BehaviorContext<'a, D, T> {
    pub(crate) fn new(
        instance: &'a mut SagaInstance<D>,
        consume: &'a ConsumeContext<T>,
        event: &'a EventName,
        scheduler: &'a dyn MessageScheduler,
    ) -> Self {
        Self {
            instance,
            consume,
            event,
            scheduler,
            outbox: Vec::new(),
            caught: None,
        }
    }

    pub fn instance(&self) -> &SagaInstance<D> {
        self.instance
    }

    pub(crate) fn instance_mut(&mut self) -> &mut SagaInstance<D> {
        self.instance
    }

    pub fn data(&self) -> &D {
        self.instance.data()
    }

    pub fn data_mut(&mut self) -> &mut D {
        self.instance.data_mut()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.instance.correlation_id()
    }

    pub fn current_state(&self) -> &State {
        self.instance.current_state()
    }

    pub fn message(&self) -> &T {
        self.consume.message()
    }

    pub fn consume_context(&self) -> &ConsumeContext<T> {
        self.consume
    }

    pub fn event(&self) -> &EventName {
        self.event
    }

    pub fn scheduler(&self) -> &dyn MessageScheduler {
        self.scheduler
    }

    /// The fault being handled, inside a `catch` handler.
    pub fn caught(&self) -> Option<&Fault> {
        self.caught.as_ref()
    }

    /// Buffer a fan-out publish, stamped with this instance's correlation id.
    pub fn publish<M: Message>(&mut self, message: &M) -> Result<(), Fault> {
        let outbound = OutboundMessage::publish(message)
            .map_err(Fault::serialization)?
            .with_correlation_id(self.correlation_id());
        self.outbox.push(outbound);
        Ok(())
    }

    /// Buffer a point-to-point send, stamped with this instance's correlation id.
    pub fn send<M: Message>(&mut self, address: &str, message: &M) -> Result<(), Fault> {
        let outbound = OutboundMessage::send(address, message)
            .map_err(Fault::serialization)?
            .with_correlation_id(self.correlation_id());
        self.outbox.push(outbound);
        Ok(())
    }

    pub(crate) fn enqueue(&mut self, message: OutboundMessage) {
        self.outbox.push(message);
    }

    pub(crate) fn into_outbox(self) -> Vec<OutboundMessage> {
        self.outbox
    }
}

pub(crate) fn run_all<D, T>(activities: &[ActivityRef<D, T>], ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
    for activity in activities {
        activity.execute(ctx)?;
    }
    Ok(())
}

/// Arbitrary user code.
pub struct Then<F>(pub F);

impl<D, T, F> Activity<D, T> for Then<F>
where
    F: Fn(&mut BehaviorContext<'_, D, T>) -> Result<(), Fault> + Send + Sync,
{
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        (self.0)(ctx)
    }
}

/// Move the instance to a new state.
#[derive(Debug, Clone)]
pub struct TransitionTo(pub State);

impl<D, T> Activity<D, T> for TransitionTo {
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        if ctx.current_state() != &self.0 {
            debug!(
                correlation_id = %ctx.correlation_id(),
                event = %ctx.event(),
                from = %ctx.current_state(),
                to = %self.0,
                "state transition"
            );
            ctx.instance_mut().set_current_state(self.0.clone());
        }
        Ok(())
    }
}

/// Which faults a `catch` block handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultMatcher {
    Kind(FaultKind),
    Any,
}

impl FaultMatcher {
    pub fn matches(&self, fault: &Fault) -> bool {
        match self {
            FaultMatcher::Kind(kind) => fault.is(kind),
            FaultMatcher::Any => true,
        }
    }
}

/// Runs `body`; a matching fault diverts to `handler` and is then considered handled.
pub struct Catch<D, T> {
    pub(crate) body: Vec<ActivityRef<D, T>>,
    pub(crate) matcher: FaultMatcher,
    pub(crate) handler: Vec<ActivityRef<D, T>>,
}

impl<D, T> Activity<D, T> for Catch<D, T> {
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        match run_all(&self.body, ctx) {
            Ok(()) => Ok(()),
            Err(fault) if self.matcher.matches(&fault) => {
                debug!(
                    correlation_id = %ctx.correlation_id(),
                    event = %ctx.event(),
                    fault = %fault,
                    "fault caught"
                );
                let previous = ctx.caught.replace(fault);
                let handled = run_all(&self.handler, ctx);
                ctx.caught = previous;
                handled
            }
            Err(fault) => Err(fault),
        }
    }
}
