//! Message contracts consumed and produced by saga instances.

use serde::Serialize;

use sagaflow_core::CorrelationId;

/// Any message a saga can consume or emit.
///
/// `message_type` is the stable, versionable name used on the wire and in
/// logs (e.g. `"orders.order_submitted"`).
pub trait Message: Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    fn message_type() -> &'static str;
}

/// Messages that carry the correlation id of the instance they belong to.
///
/// Events declared for such messages are correlated by identity without any
/// further configuration.
pub trait CorrelatedBy {
    fn correlation_id(&self) -> CorrelationId;
}
