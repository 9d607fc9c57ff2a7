use thiserror::Error;

use fchat_net::ConnectionError;
use fchat_store::StoreError;

/// Why a session ended abnormally. Every variant is terminal for the
/// connection only; the server keeps accepting.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A packet that is malformed or not allowed in the current state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection error: {0}")]
    Connection(ConnectionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn violation(reason: impl Into<String>) -> Self {
        SessionError::ProtocolViolation(reason.into())
    }
}

impl From<ConnectionError> for SessionError {
    fn from(error: ConnectionError) -> Self {
        match error {
            // The peer sent something unreadable: its fault, not the transport's.
            ConnectionError::Decode(_) | ConnectionError::FrameTooLarge { .. } => {
                SessionError::ProtocolViolation(error.to_string())
            }
            other => SessionError::Connection(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use fchat_shared::DecodeError;

    use super::*;

    #[test]
    fn test_malformed_input_is_a_violation() {
        let err = SessionError::from(ConnectionError::Decode(DecodeError::MissingType));
        assert!(matches!(err, SessionError::ProtocolViolation(_)));

        let err = SessionError::from(ConnectionError::FrameTooLarge { size: 10, max: 1 });
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn test_transport_failure_stays_a_connection_error() {
        let err = SessionError::from(ConnectionError::ReadInProgress);
        assert!(matches!(err, SessionError::Connection(_)));
    }
}
