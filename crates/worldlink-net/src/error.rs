//! Errors surfaced by joining a world.

use crate::transport::CloseInfo;

/// No usable join credential.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The provider returned an empty or absent key.
    #[error("unable to secure a join key, are the account details valid?")]
    Missing,

    /// The provider failed outright.
    #[error("join key provider failed: {0}")]
    Provider(#[source] anyhow::Error),
}

/// Why a join did not reach the connected state.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// No credential; not retried.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Every attempt in the window failed before an init frame arrived.
    #[error("unable to connect after {attempts} attempts (last failure: {last_failure})")]
    ConnectionExhausted { attempts: u32, last_failure: String },

    /// The server closed the socket before init and retrying is disabled.
    #[error("server closed the connection before init: {0}")]
    ProtocolClose(CloseInfo),

    /// Another join is still in progress on this client.
    #[error("already trying to connect")]
    AlreadyConnecting,

    /// The session already has a live, initialized socket.
    #[error("already connected")]
    AlreadyConnected,

    /// The join was aborted by a disconnect.
    #[error("join cancelled")]
    Cancelled,

    /// The configured game endpoint is not a valid URL.
    #[error("invalid game endpoint: {0}")]
    InvalidEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_names_attempts() {
        let err = JoinError::ConnectionExhausted {
            attempts: 3,
            last_failure: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unable to connect after 3 attempts (last failure: connection refused)"
        );
    }

    #[test]
    fn test_credential_error_passes_through() {
        let err = JoinError::from(CredentialError::Missing);
        assert!(err.to_string().starts_with("unable to secure a join key"));
    }
}
