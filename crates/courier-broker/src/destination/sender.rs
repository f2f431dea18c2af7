//! Producer registrations on a destination.

use chrono::{DateTime, Utc};

/// Request to register a producer.
#[derive(Debug, Clone)]
pub struct SenderRequest {
    /// Destination the producer targets; empty on removal means
    /// "search every destination".
    pub destination_uri: String,

    /// Producer id, unique within the destination.
    pub sender_id: String,

    /// Owning session.
    pub session_id: String,

    /// Owning client.
    pub client_id: String,
}

/// A registered producer.
#[derive(Debug, Clone)]
pub struct Sender {
    pub sender_id: String,
    pub session_id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
}

impl Sender {
    pub fn from_request(request: &SenderRequest) -> Self {
        Self {
            sender_id: request.sender_id.clone(),
            session_id: request.session_id.clone(),
            client_id: request.client_id.clone(),
            created_at: Utc::now(),
        }
    }
}
