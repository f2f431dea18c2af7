//! Message model: typed properties, body, and delivery records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::selector::Value;

/// A typed message property, evaluated by selectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl PropertyValue {
    /// View this property as a selector value. `Null` maps to UNKNOWN.
    pub fn as_value(&self) -> Value<'_> {
        match self {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::Exact(*i),
            PropertyValue::Float(f) => Value::Inexact(*f),
            PropertyValue::Text(s) => Value::Str(s),
            PropertyValue::Null => Value::Unknown,
        }
    }
}

/// Property map attached to every message.
pub type Properties = HashMap<String, PropertyValue>;

/// A message as accepted by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique message id.
    pub message_id: String,

    /// Destination URI the producer addressed.
    pub destination_uri: String,

    /// Producer-declared body type code.
    pub body_type: i32,

    /// Delivery priority (currently informational).
    pub priority: i32,

    /// Absolute expiry, milliseconds since the Unix epoch; 0 = never.
    pub expiration_ms: i64,

    /// Typed properties, evaluated by subscription selectors.
    pub properties: Properties,

    /// Opaque body bytes.
    pub body: Vec<u8>,
}

impl Message {
    /// Build a message with empty properties and no expiry.
    pub fn new(message_id: impl Into<String>, destination_uri: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            destination_uri: destination_uri.into(),
            body_type: 0,
            priority: 4,
            expiration_ms: 0,
            properties: Properties::new(),
            body: Vec::new(),
        }
    }

    /// Attach a property.
    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Whether the message has expired at `now_ms` (epoch milliseconds).
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expiration_ms != 0 && self.expiration_ms <= now_ms
    }
}

/// A message pushed to one subscription's consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Canonical key of the destination that dispatched the message.
    pub destination_key: String,

    /// Name of the receiving subscription.
    pub subscription: String,

    /// Durable log position of the message.
    pub seq: i64,

    /// The message itself.
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Value;

    #[test]
    fn test_property_as_value() {
        assert!(matches!(
            PropertyValue::Int(5).as_value(),
            Value::Exact(5)
        ));
        assert!(matches!(
            PropertyValue::Text("a".into()).as_value(),
            Value::Str("a")
        ));
        assert!(PropertyValue::Null.as_value().is_unknown());
    }

    #[test]
    fn test_expiry() {
        let mut msg = Message::new("m1", "queue://q");
        assert!(!msg.is_expired_at(i64::MAX));
        msg.expiration_ms = 1_000;
        assert!(msg.is_expired_at(1_000));
        assert!(msg.is_expired_at(2_000));
        assert!(!msg.is_expired_at(999));
    }
}
