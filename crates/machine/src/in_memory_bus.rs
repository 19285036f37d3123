//! In-memory message bus for tests/dev.
//!
//! Two kinds of subscription:
//! - [`MessageBus::subscribe`] taps the whole stream, publishes and sends alike.
//! - [`InMemoryMessageBus::endpoint`] receives only messages sent to one
//!   address. Several receivers on the same address compete: each message goes
//!   to one of them, round-robin.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, mpsc};

use tracing::debug;

use crate::bus::{Destination, MessageBus, OutboundMessage, Subscription};
use crate::context::ConsumeContext;

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

/// Messages that may be addressed to a single endpoint.
pub trait Addressed {
    /// The endpoint for point-to-point delivery; `None` for fan-out.
    fn send_address(&self) -> Option<&str>;
}

impl Addressed for OutboundMessage {
    fn send_address(&self) -> Option<&str> {
        match &self.destination {
            Destination::Send { address } => Some(address),
            Destination::Publish => None,
        }
    }
}

/// Inbound deliveries are already at their endpoint.
impl<T> Addressed for ConsumeContext<T> {
    fn send_address(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug)]
struct Routes<M> {
    taps: Vec<mpsc::Sender<M>>,
    endpoints: HashMap<String, VecDeque<mpsc::Sender<M>>>,
}

/// In-memory bus with fan-out taps and addressed endpoints.
///
/// - No IO / no async
/// - A send to an address nobody listens on only reaches the taps
/// - At-least-once acceptable (subscribers must be idempotent)
#[derive(Debug)]
pub struct InMemoryMessageBus<M> {
    routes: Mutex<Routes<M>>,
}

impl<M> InMemoryMessageBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive the messages sent to `address`.
    pub fn endpoint(&self, address: impl Into<String>) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut routes) = self.routes.lock() {
            routes.endpoints.entry(address.into()).or_default().push_back(tx);
        }
        Subscription::new(rx)
    }
}

impl<M> Default for InMemoryMessageBus<M> {
    fn default() -> Self {
        Self {
            routes: Mutex::new(Routes {
                taps: Vec::new(),
                endpoints: HashMap::new(),
            }),
        }
    }
}

impl<M> MessageBus<M> for InMemoryMessageBus<M>
where
    M: Addressed + Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut routes = self.routes.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        if let Some(address) = message.send_address() {
            let delivered = match routes.endpoints.get_mut(address) {
                Some(receivers) => deliver_to_one(receivers, &message),
                None => false,
            };
            if !delivered {
                debug!(address, "no endpoint listening; message reaches taps only");
            }
        }

        // Drop any dead taps while publishing.
        routes.taps.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut routes) = self.routes.lock() {
            routes.taps.push(tx);
        }

        Subscription::new(rx)
    }
}

/// Hand the message to the next live receiver and move it to the back.
fn deliver_to_one<M: Clone>(receivers: &mut VecDeque<mpsc::Sender<M>>, message: &M) -> bool {
    while let Some(tx) = receivers.pop_front() {
        if tx.send(message.clone()).is_ok() {
            receivers.push_back(tx);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::Message;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Charge {
        amount: u32,
    }

    impl Message for Charge {
        fn message_type() -> &'static str {
            "billing.charge"
        }
    }

    fn amount(message: &OutboundMessage) -> u64 {
        message.payload["amount"].as_u64().unwrap()
    }

    #[test]
    fn every_tap_gets_a_copy() {
        let bus = InMemoryMessageBus::<OutboundMessage>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(OutboundMessage::publish(&Charge { amount: 7 }).unwrap()).unwrap();
        assert_eq!(amount(&a.try_recv().unwrap()), 7);
        assert_eq!(amount(&b.try_recv().unwrap()), 7);
    }

    #[test]
    fn sends_reach_only_their_endpoint() {
        let bus = InMemoryMessageBus::<OutboundMessage>::new();
        let billing = bus.endpoint("billing");
        let shipping = bus.endpoint("shipping");
        let tap = bus.subscribe();

        bus.publish(OutboundMessage::send("billing", &Charge { amount: 3 }).unwrap())
            .unwrap();
        bus.publish(OutboundMessage::publish(&Charge { amount: 4 }).unwrap()).unwrap();

        assert_eq!(amount(&billing.try_recv().unwrap()), 3);
        assert!(billing.try_recv().is_err());
        assert!(shipping.try_recv().is_err());
        assert_eq!(amount(&tap.try_recv().unwrap()), 3);
        assert_eq!(amount(&tap.try_recv().unwrap()), 4);
    }

    #[test]
    fn endpoint_receivers_compete_round_robin() {
        let bus = InMemoryMessageBus::<OutboundMessage>::new();
        let first = bus.endpoint("billing");
        let second = bus.endpoint("billing");

        for n in 1..=4 {
            bus.publish(OutboundMessage::send("billing", &Charge { amount: n }).unwrap())
                .unwrap();
        }

        let got_first: Vec<_> = std::iter::from_fn(|| first.try_recv().ok()).map(|m| amount(&m)).collect();
        let got_second: Vec<_> = std::iter::from_fn(|| second.try_recv().ok()).map(|m| amount(&m)).collect();
        assert_eq!(got_first, vec![1, 3]);
        assert_eq!(got_second, vec![2, 4]);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = InMemoryMessageBus::<OutboundMessage>::new();
        drop(bus.subscribe());
        drop(bus.endpoint("billing"));
        let live = bus.endpoint("billing");

        bus.publish(OutboundMessage::send("billing", &Charge { amount: 1 }).unwrap())
            .unwrap();

        assert_eq!(amount(&live.try_recv().unwrap()), 1);
        let routes = bus.routes.lock().unwrap();
        assert!(routes.taps.is_empty());
        assert_eq!(routes.endpoints["billing"].len(), 1);
    }

    #[test]
    fn inbound_contexts_fan_out() {
        let bus = InMemoryMessageBus::<ConsumeContext<Charge>>::new();
        let tap = bus.subscribe();
        bus.publish(ConsumeContext::new(Charge { amount: 9 })).unwrap();
        assert_eq!(tap.try_recv().unwrap().message().amount, 9);
    }
}
