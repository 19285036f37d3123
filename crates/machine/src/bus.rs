//! Outbound message transport abstraction (mechanics only).
//!
//! Saga instances never talk to a transport directly. Activities append
//! [`OutboundMessage`]s to an outbox during a transition, and the dispatch
//! pipeline hands them to a [`MessageBus`] only after the instance has been
//! persisted. If persistence fails the outbox is dropped.
//!
//! ## Delivery
//!
//! The bus provides **at-least-once delivery**: a retried dispatch may publish
//! the same logical message again. Consumers must be idempotent.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use sagaflow_core::{CorrelationId, MessageId, RequestId, TokenId};

use crate::context::ConsumeContext;
use crate::message::Message;

/// A subscription to a message stream.
///
/// Each subscription gets a copy of every message published to the bus
/// (broadcast semantics). Subscriptions are meant for single-threaded
/// consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub abstraction.
///
/// `publish()` can fail (bus full, network error). Failures are surfaced to
/// the caller, which by then has already persisted the instance; retrying the
/// publication is safe.
pub trait MessageBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> MessageBus<M> for Arc<B>
where
    B: MessageBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Fan out to every subscriber of the message type.
    Publish,
    /// Point-to-point delivery to a named endpoint.
    Send { address: String },
}

/// A serialized message waiting in an outbox (or in the scheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub destination: Destination,
    pub correlation_id: Option<CorrelationId>,
    pub request_id: Option<RequestId>,
    pub scheduling_token: Option<TokenId>,
    pub payload: JsonValue,
}

impl OutboundMessage {
    pub fn publish<M: Message>(message: &M) -> Result<Self, serde_json::Error> {
        Self::encode(Destination::Publish, message)
    }

    pub fn send<M: Message>(address: impl Into<String>, message: &M) -> Result<Self, serde_json::Error> {
        Self::encode(
            Destination::Send {
                address: address.into(),
            },
            message,
        )
    }

    fn encode<M: Message>(destination: Destination, message: &M) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: MessageId::new(),
            message_type: M::message_type().to_string(),
            destination,
            correlation_id: None,
            request_id: None,
            scheduling_token: None,
            payload: serde_json::to_value(message)?,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_scheduling_token(mut self, token: TokenId) -> Self {
        self.scheduling_token = Some(token);
        self
    }

    pub fn is_type<M: Message>(&self) -> bool {
        self.message_type == M::message_type()
    }

    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Rebuild the inbound context a consumer of this message would see.
    pub fn to_consume_context<M: DeserializeOwned>(&self) -> Result<ConsumeContext<M>, serde_json::Error> {
        let mut ctx = ConsumeContext::new(self.decode::<M>()?).with_message_id(self.message_id);
        if let Some(id) = self.correlation_id {
            ctx = ctx.with_correlation_id(id);
        }
        if let Some(id) = self.request_id {
            ctx = ctx.with_request_id(id);
        }
        if let Some(token) = self.scheduling_token {
            ctx = ctx.with_scheduling_token(token);
        }
        Ok(ctx)
    }
}
