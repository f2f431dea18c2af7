//! Destination URI grammar and key normalization.
//!
//! Clients address destinations as `scheme://name` with scheme one of
//! `queue`, `topic`, `temp-queue`, `temp-topic`. Internally the broker
//! identifies a destination by its key `<prefix>/<name>`, where the
//! prefix is a fixed constant per destination kind.

use courier_common::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};

/// Key prefix for regular queues.
pub const QUEUE_PREFIX: &str = "queue";
/// Key prefix for regular topics.
pub const TOPIC_PREFIX: &str = "topic";
/// Key prefix for temporary queues.
pub const TEMP_QUEUE_PREFIX: &str = "temp_queue";
/// Key prefix for temporary topics.
pub const TEMP_TOPIC_PREFIX: &str = "temp_topic";

/// Destination kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
    TempQueue,
    TempTopic,
}

impl DestinationKind {
    /// Parse a URI scheme into a kind.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "queue" => Some(DestinationKind::Queue),
            "topic" => Some(DestinationKind::Topic),
            "temp-queue" => Some(DestinationKind::TempQueue),
            "temp-topic" => Some(DestinationKind::TempTopic),
            _ => None,
        }
    }

    /// The URI scheme for this kind.
    pub fn scheme(&self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
            DestinationKind::TempQueue => "temp-queue",
            DestinationKind::TempTopic => "temp-topic",
        }
    }

    /// The internal key prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DestinationKind::Queue => QUEUE_PREFIX,
            DestinationKind::Topic => TOPIC_PREFIX,
            DestinationKind::TempQueue => TEMP_QUEUE_PREFIX,
            DestinationKind::TempTopic => TEMP_TOPIC_PREFIX,
        }
    }

    /// Integer code stored in the destinations table `type` column.
    pub fn code(&self) -> i32 {
        match self {
            DestinationKind::Queue => 0,
            DestinationKind::Topic => 1,
            DestinationKind::TempQueue => 2,
            DestinationKind::TempTopic => 3,
        }
    }

    /// Inverse of [`DestinationKind::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DestinationKind::Queue),
            1 => Some(DestinationKind::Topic),
            2 => Some(DestinationKind::TempQueue),
            3 => Some(DestinationKind::TempTopic),
            _ => None,
        }
    }

    /// Whether destinations of this kind die with their owner.
    pub fn is_temporary(&self) -> bool {
        matches!(self, DestinationKind::TempQueue | DestinationKind::TempTopic)
    }

    /// Whether this kind has point-to-point (queue) delivery semantics.
    pub fn is_queue(&self) -> bool {
        matches!(self, DestinationKind::Queue | DestinationKind::TempQueue)
    }
}

/// A parsed destination URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationUri {
    pub kind: DestinationKind,
    pub name: String,
}

impl DestinationUri {
    /// Parse `scheme://name`.
    pub fn parse(uri: &str) -> BrokerResult<Self> {
        let (scheme, name) = uri
            .split_once("://")
            .ok_or_else(|| BrokerError::unknown("malformed destination uri", uri))?;
        let kind = DestinationKind::from_scheme(scheme)
            .ok_or_else(|| BrokerError::unknown("unknown destination scheme", uri))?;
        if name.is_empty() {
            return Err(BrokerError::unknown("empty destination name", uri));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }

    /// The canonical key `<prefix>/<name>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.prefix(), self.name)
    }

    /// The canonical URI `scheme://name`.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.kind.scheme(), self.name)
    }
}

/// Normalize a destination reference to its canonical key.
///
/// URIs (containing `://`) are converted to `<prefix>/<name>`; anything
/// else is assumed to already be a key and is returned as-is, which
/// makes the function idempotent.
pub fn main_destination_path(uri: &str) -> BrokerResult<String> {
    if uri.contains("://") {
        Ok(DestinationUri::parse(uri)?.key())
    } else {
        Ok(uri.to_string())
    }
}

/// Parse either a `scheme://name` URI or a canonical `<prefix>/<name>`
/// key into its components.
pub fn parse_reference(reference: &str) -> BrokerResult<DestinationUri> {
    if reference.contains("://") {
        return DestinationUri::parse(reference);
    }
    match split_key(reference) {
        Some((kind, name)) if !name.is_empty() => Ok(DestinationUri {
            kind,
            name: name.to_string(),
        }),
        _ => Err(BrokerError::unknown(
            "malformed destination reference",
            reference,
        )),
    }
}

/// Reconstruct the kind and plain name from a canonical key.
pub fn split_key(key: &str) -> Option<(DestinationKind, &str)> {
    let (prefix, name) = key.split_once('/')?;
    let kind = match prefix {
        QUEUE_PREFIX => DestinationKind::Queue,
        TOPIC_PREFIX => DestinationKind::Topic,
        TEMP_QUEUE_PREFIX => DestinationKind::TempQueue,
        TEMP_TOPIC_PREFIX => DestinationKind::TempTopic,
        _ => return None,
    };
    Some((kind, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_schemes() {
        assert_eq!(
            DestinationUri::parse("queue://orders").unwrap().kind,
            DestinationKind::Queue
        );
        assert_eq!(
            DestinationUri::parse("topic://prices").unwrap().kind,
            DestinationKind::Topic
        );
        assert_eq!(
            DestinationUri::parse("temp-queue://replies").unwrap().kind,
            DestinationKind::TempQueue
        );
        assert_eq!(
            DestinationUri::parse("temp-topic://events").unwrap().kind,
            DestinationKind::TempTopic
        );
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        assert!(DestinationUri::parse("orders").is_err());
        assert!(DestinationUri::parse("stack://orders").is_err());
        assert!(DestinationUri::parse("queue://").is_err());
    }

    #[test]
    fn test_main_destination_path_idempotent() {
        let once = main_destination_path("queue://orders").unwrap();
        let twice = main_destination_path(&once).unwrap();
        assert_eq!(once, "queue/orders");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_key_round_trip() {
        let parsed = DestinationUri::parse("temp-topic://t1").unwrap();
        assert_eq!(parsed.key(), "temp_topic/t1");
        assert_eq!(parsed.uri(), "temp-topic://t1");
        let key = parsed.key();
        let (kind, name) = split_key(&key).unwrap();
        assert_eq!(kind, DestinationKind::TempTopic);
        assert_eq!(name, "t1");
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for kind in [
            DestinationKind::Queue,
            DestinationKind::Topic,
            DestinationKind::TempQueue,
            DestinationKind::TempTopic,
        ] {
            assert_eq!(DestinationKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(DestinationKind::from_code(9), None);
    }
}
