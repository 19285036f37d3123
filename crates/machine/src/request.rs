//! Request sub-protocol: a saga asks another service something and waits.
//!
//! Declaring a request registers three events (`<name>.Completed`,
//! `<name>.Faulted`, `<name>.TimeoutExpired`) correlated by the pending
//! request id stored in the instance, plus a `<name>.Pending` state. In every
//! non-initial state those events first run a cleanup step: cancel the
//! timeout (for completed/faulted) and clear the pending request id. Cleanup
//! only acts while the slot still holds the delivered request id, so a second
//! response for the same request is a no-op for the slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sagaflow_core::{CorrelationId, Fault, QueryHint, RequestId, SagaInstance, SagaQuery, State, TokenId};

use crate::activity::{Activity, BehaviorContext};
use crate::bus::OutboundMessage;
use crate::context::ConsumeContext;
use crate::correlation::QueryFn;
use crate::event::Event;
use crate::message::Message;

/// Where requests go and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSettings {
    /// Endpoint the request is sent to; `None` publishes it.
    pub service_address: Option<String>,
    /// Zero disables the timeout message.
    pub timeout: Duration,
}

impl RequestSettings {
    pub fn send_to(service_address: impl Into<String>) -> Self {
        Self {
            service_address: Some(service_address.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_timeout(&self) -> bool {
        !self.timeout.is_zero()
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            service_address: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Fault response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFault<Req> {
    pub request_id: RequestId,
    pub kind: String,
    pub message: String,
    pub request: Req,
    pub occurred_at: DateTime<Utc>,
}

impl<Req: Message> Message for RequestFault<Req> {
    fn message_type() -> &'static str {
        "sagaflow.request_fault"
    }
}

/// Delivered by the scheduler when a request went unanswered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTimeoutExpired<Req> {
    pub correlation_id: CorrelationId,
    pub request_id: RequestId,
    pub expired_at: DateTime<Utc>,
    pub request: Req,
}

impl<Req: Message> Message for RequestTimeoutExpired<Req> {
    fn message_type() -> &'static str {
        "sagaflow.request_timeout_expired"
    }
}

/// Handle to a declared request.
pub struct Request<Req, Resp> {
    name: String,
    settings: RequestSettings,
    pending: State,
    completed: Event<Resp>,
    faulted: Event<RequestFault<Req>>,
    timeout_expired: Event<RequestTimeoutExpired<Req>>,
}

impl<Req, Resp> Request<Req, Resp> {
    pub(crate) fn new(
        name: String,
        settings: RequestSettings,
        pending: State,
        completed: Event<Resp>,
        faulted: Event<RequestFault<Req>>,
        timeout_expired: Event<RequestTimeoutExpired<Req>>,
    ) -> Self {
        Self {
            name,
            settings,
            pending,
            completed,
            faulted,
            timeout_expired,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &RequestSettings {
        &self.settings
    }

    pub fn pending(&self) -> &State {
        &self.pending
    }

    pub fn completed(&self) -> &Event<Resp> {
        &self.completed
    }

    pub fn faulted(&self) -> &Event<RequestFault<Req>> {
        &self.faulted
    }

    pub fn timeout_expired(&self) -> &Event<RequestTimeoutExpired<Req>> {
        &self.timeout_expired
    }
}

impl<Req, Resp> Clone for Request<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            settings: self.settings.clone(),
            pending: self.pending.clone(),
            completed: self.completed.clone(),
            faulted: self.faulted.clone(),
            timeout_expired: self.timeout_expired.clone(),
        }
    }
}

impl<Req, Resp> core::fmt::Debug for Request<Req, Resp> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Reads the request id a response belongs to.
pub(crate) type RequestIdFn<T> = Arc<dyn Fn(&ConsumeContext<T>) -> Option<RequestId> + Send + Sync>;

/// Query matching the instance whose named request slot holds the delivered request id.
pub(crate) fn pending_request_query<D, T>(slot: String, extract: RequestIdFn<T>) -> QueryFn<D, T>
where
    D: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    Arc::new(move |ctx: &ConsumeContext<T>| {
        let request_id = extract(ctx)?;
        let slot = slot.clone();
        Some(
            SagaQuery::new(format!("{slot} request {request_id}"), move |instance: &SagaInstance<D>| {
                instance.request_id(&slot) == Some(request_id)
            })
            .with_hint(QueryHint::PendingRequest(request_id)),
        )
    })
}

pub(crate) type RequestBuilder<D, T, Req> =
    Arc<dyn Fn(&BehaviorContext<'_, D, T>) -> Result<Req, Fault> + Send + Sync>;

/// Sends the request, records its id and schedules the timeout.
pub(crate) struct SendRequest<D, T, Req> {
    name: String,
    settings: RequestSettings,
    build: RequestBuilder<D, T, Req>,
}

impl<D, T, Req> SendRequest<D, T, Req> {
    pub(crate) fn new(name: String, settings: RequestSettings, build: RequestBuilder<D, T, Req>) -> Self {
        Self { name, settings, build }
    }
}

impl<D, T, Req> Activity<D, T> for SendRequest<D, T, Req>
where
    Req: Message,
{
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        let request = (self.build)(ctx)?;
        let request_id = RequestId::new();
        let correlation_id = ctx.correlation_id();

        let outbound = match &self.settings.service_address {
            Some(address) => OutboundMessage::send(address.as_str(), &request),
            None => OutboundMessage::publish(&request),
        }
        .map_err(Fault::serialization)?
        .with_correlation_id(correlation_id)
        .with_request_id(request_id);

        ctx.instance_mut().set_request_id(&self.name, Some(request_id));
        ctx.enqueue(outbound);

        if self.settings.has_timeout() {
            let timeout = chrono::Duration::from_std(self.settings.timeout).map_err(Fault::scheduler)?;
            let expired_at = Utc::now() + timeout;
            let expired = RequestTimeoutExpired {
                correlation_id,
                request_id,
                expired_at,
                request,
            };
            let scheduled = OutboundMessage::publish(&expired)
                .map_err(Fault::serialization)?
                .with_correlation_id(correlation_id)
                .with_request_id(request_id)
                .with_scheduling_token(TokenId::from(request_id));
            ctx.scheduler()
                .schedule_at(expired_at, scheduled)
                .map_err(Fault::scheduler)?;
        }

        debug!(
            correlation_id = %correlation_id,
            request = %self.name,
            request_id = %request_id,
            "request sent"
        );
        Ok(())
    }
}

/// Cleanup run before user activities for every request response.
///
/// Reads the request id with the same extractor the correlation query uses.
pub(crate) struct ClearRequest<T> {
    name: String,
    cancel_timeout: bool,
    extract: RequestIdFn<T>,
}

impl<T> ClearRequest<T> {
    pub(crate) fn new(name: String, settings: &RequestSettings, cancel_timeout: bool, extract: RequestIdFn<T>) -> Self {
        Self {
            name,
            cancel_timeout: cancel_timeout && settings.has_timeout(),
            extract,
        }
    }
}

impl<D, T> Activity<D, T> for ClearRequest<T> {
    fn execute(&self, ctx: &mut BehaviorContext<'_, D, T>) -> Result<(), Fault> {
        let Some(pending) = ctx.instance().request_id(&self.name) else {
            return Ok(());
        };
        let delivered = (self.extract)(ctx.consume_context());
        if delivered != Some(pending) {
            debug!(
                correlation_id = %ctx.correlation_id(),
                request = %self.name,
                pending = %pending,
                "response does not belong to the pending request; slot kept"
            );
            return Ok(());
        }

        if self.cancel_timeout {
            ctx.scheduler()
                .cancel(TokenId::from(pending))
                .map_err(Fault::scheduler)?;
        }
        ctx.instance_mut().set_request_id(&self.name, None);
        debug!(
            correlation_id = %ctx.correlation_id(),
            request = %self.name,
            request_id = %pending,
            "pending request cleared"
        );
        Ok(())
    }
}
