//! `sagaflow-machine`: declarative saga state machines.
//!
//! This crate defines **what** a saga does: its states, the events it reacts
//! to, how each message finds its instance, and the activities run on each
//! transition. It does not load or store instances; the dispatch pipeline in
//! `sagaflow-infra` wraps the engine with a repository.
//!
//! ```ignore
//! let mut b = StateMachine::<Order>::builder("orders");
//! let running = b.state("Running");
//! let started = b.correlated_event::<OrderStarted>("Started");
//! let stopped = b.correlated_event::<OrderStopped>("Stopped");
//!
//! b.initially(b.when(&started).then(record_customer).transition_to(&running));
//! b.during(&[&running], b.when(&stopped).finalize());
//! b.set_completed_when_finalized();
//! let machine = b.build()?;
//! ```

pub mod activity;
pub mod behavior;
pub mod bus;
pub mod context;
pub mod correlation;
pub mod error;
pub mod event;
pub mod in_memory_bus;
pub mod machine;
pub mod message;
pub mod request;
pub mod schedule;
pub mod scheduler;

pub use activity::{Activity, BehaviorContext, FaultMatcher};
pub use behavior::{EventActivities, when};
pub use bus::{Destination, MessageBus, OutboundMessage, Subscription};
pub use context::{CancellationSignal, ConsumeContext};
pub use correlation::{
    CorrelationConventions, CorrelationInfo, CorrelationKind, CorrelationTarget, EventCorrelator, MissingKind,
    NotFoundPolicy,
};
pub use error::{DeclarationError, MachineError};
pub use event::{Event, EventName};
pub use in_memory_bus::{Addressed, InMemoryBusError, InMemoryMessageBus};
pub use machine::{DeclarationTable, Disposition, EventSummary, StateMachine, StateMachineBuilder, Transition};
pub use message::{CorrelatedBy, Message};
pub use request::{Request, RequestFault, RequestSettings, RequestTimeoutExpired};
pub use schedule::{Schedule, ScheduleSettings};
pub use scheduler::{InMemoryScheduler, MessageScheduler, ScheduledMessage, SchedulerError};
