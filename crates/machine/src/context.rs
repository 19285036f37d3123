//! Inbound delivery context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use sagaflow_core::{CorrelationId, MessageId, RequestId, TokenId};

/// Cooperative cancellation flag shared between a delivery and its consumer.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A delivered message plus the transport headers the runtime needs.
///
/// - `correlation_id`: header set by the sender (e.g. on scheduled messages)
/// - `request_id`: set on responses and faults of a request
/// - `scheduling_token`: set by the scheduler on deferred deliveries
#[derive(Debug, Clone)]
pub struct ConsumeContext<T> {
    message_id: MessageId,
    correlation_id: Option<CorrelationId>,
    request_id: Option<RequestId>,
    scheduling_token: Option<TokenId>,
    sent_at: DateTime<Utc>,
    cancellation: CancellationSignal,
    message: T,
}

impl<T> ConsumeContext<T> {
    pub fn new(message: T) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: None,
            request_id: None,
            scheduling_token: None,
            sent_at: Utc::now(),
            cancellation: CancellationSignal::new(),
            message,
        }
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
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

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationSignal) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn scheduling_token(&self) -> Option<TokenId> {
        self.scheduling_token
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let signal = CancellationSignal::new();
        let ctx = ConsumeContext::new(5_u32).with_cancellation(signal.clone());
        let copy = ctx.clone();
        assert!(!copy.is_cancelled());
        signal.cancel();
        assert!(ctx.is_cancelled());
        assert!(copy.is_cancelled());
    }

    #[test]
    fn headers_default_to_none() {
        let ctx = ConsumeContext::new("hello");
        assert!(ctx.correlation_id().is_none());
        assert!(ctx.request_id().is_none());
        assert!(ctx.scheduling_token().is_none());
        assert_eq!(*ctx.message(), "hello");
    }
}
