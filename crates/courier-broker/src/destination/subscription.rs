//! Subscription state for a destination.

use tokio::sync::mpsc;

use crate::message::Delivery;
use crate::selector::Selector;

/// Consumption mode of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Sole consumer of the destination while attached.
    Exclusive,

    /// Competing consumer (queue) or independent reader (topic).
    Shared,

    /// Read-only iteration of the durable log; never acknowledges.
    Browser,
}

/// Request to register (or re-attach) a subscription.
#[derive(Debug)]
pub struct SubscribeRequest {
    /// Destination the subscription targets.
    pub destination_uri: String,

    /// Subscription name; durable subscriptions re-attach by this name.
    pub name: String,

    /// Owning session.
    pub session_id: String,

    /// Owning client.
    pub client_id: String,

    /// Optional selector source text.
    pub selector: Option<String>,

    /// Consumption mode.
    pub mode: SubscriptionMode,

    /// Whether the subscription outlives its session.
    pub durable: bool,

    /// Channel the dispatcher pushes deliveries into; the front-end
    /// session owns the receiving half.
    pub sink: mpsc::UnboundedSender<Delivery>,
}

/// A live subscription on a destination.
#[derive(Debug)]
pub struct Subscription {
    pub name: String,
    pub session_id: String,
    pub client_id: String,
    pub selector: Option<Selector>,
    pub mode: SubscriptionMode,
    pub durable: bool,

    /// Position in the destination's durable log: highest `seq` this
    /// subscription has consumed (topics and browsers).
    pub cursor: i64,

    /// Detached durable subscriptions stay registered but receive
    /// nothing until a session re-attaches them.
    pub attached: bool,

    pub(crate) sink: mpsc::UnboundedSender<Delivery>,
}

impl Subscription {
    /// An attached consumer that participates in dispatch.
    pub fn is_active_consumer(&self) -> bool {
        self.attached && self.mode != SubscriptionMode::Browser
    }

    /// Whether the message properties pass this subscription's
    /// selector; no selector matches everything.
    pub fn selects(&self, properties: &crate::message::Properties) -> bool {
        match &self.selector {
            Some(selector) => selector.matches(properties),
            None => true,
        }
    }

    /// Push a delivery to the consumer. Returns false when the
    /// receiving half is gone.
    pub(crate) fn push(&self, delivery: Delivery) -> bool {
        self.sink.send(delivery).is_ok()
    }
}
