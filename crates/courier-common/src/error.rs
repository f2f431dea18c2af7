//! Error types for the Courier broker core.

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Classification code carried by every [`BrokerError`].
///
/// Front ends report these codes to clients; the variants mirror the
/// recoverability contract: `Storage` is fatal at broker level, the
/// rest are per-operation failures the broker survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    NotFound,
    OnSaveMessage,
    OnSubscription,
    InvalidState,
    Unknown,
}

/// Unified error type for the broker core.
///
/// Every variant carries a human-readable message plus the contextual
/// payload (sql text, uri, id) that produced it.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("storage failure: {message} [{context}]")]
    Storage { message: String, context: String },

    #[error("not found: {message} [{context}]")]
    NotFound { message: String, context: String },

    #[error("can't save message: {message} [{context}]")]
    OnSaveMessage { message: String, context: String },

    #[error("subscription failure: {message} [{context}]")]
    OnSubscription { message: String, context: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("unknown failure: {message} [{context}]")]
    Unknown { message: String, context: String },
}

impl BrokerError {
    pub fn storage(message: impl Into<String>, context: impl Into<String>) -> Self {
        BrokerError::Storage {
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn not_found(message: impl Into<String>, context: impl Into<String>) -> Self {
        BrokerError::NotFound {
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn on_save_message(message: impl Into<String>, context: impl Into<String>) -> Self {
        BrokerError::OnSaveMessage {
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn on_subscription(message: impl Into<String>, context: impl Into<String>) -> Self {
        BrokerError::OnSubscription {
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        BrokerError::InvalidState {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>, context: impl Into<String>) -> Self {
        BrokerError::Unknown {
            message: message.into(),
            context: context.into(),
        }
    }

    /// The classification code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Storage { .. } => ErrorKind::Storage,
            BrokerError::NotFound { .. } => ErrorKind::NotFound,
            BrokerError::OnSaveMessage { .. } => ErrorKind::OnSaveMessage,
            BrokerError::OnSubscription { .. } => ErrorKind::OnSubscription,
            BrokerError::InvalidState { .. } => ErrorKind::InvalidState,
            BrokerError::Unknown { .. } => ErrorKind::Unknown,
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        BrokerError::Storage {
            message: err.to_string(),
            context: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            BrokerError::storage("boom", "select 1").kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            BrokerError::not_found("destination", "queue/q1").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BrokerError::invalid_state("already running").kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_display_carries_context() {
        let err = BrokerError::on_save_message("insert failed", "msg-42");
        let text = err.to_string();
        assert!(text.contains("insert failed"));
        assert!(text.contains("msg-42"));
    }

    #[test]
    fn test_sqlx_error_maps_to_storage() {
        let err: BrokerError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
