//! Front-end session handle.
//!
//! The wire protocol and connection management live outside the core;
//! the exchange only needs a stable session identity, the owning client
//! id, and the session's cached storage session, which the save path
//! resets after a storage failure.

use tokio::sync::Mutex;

use crate::storage::StorageSession;

/// A client session as seen by the exchange.
pub struct ClientSession {
    /// Stable session identifier.
    pub id: String,

    /// Identifier of the connected client.
    pub client_id: String,

    /// Cached storage session for the save path.
    pub(crate) db: Mutex<Option<StorageSession>>,
}

impl ClientSession {
    pub fn new(id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            db: Mutex::new(None),
        }
    }

    /// Drop the cached storage session; the next save acquires a fresh
    /// one from the pool.
    pub async fn reset_db(&self) {
        *self.db.lock().await = None;
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .finish()
    }
}
