//! API error types.

use worldlink_net::CredentialError;

/// Errors returned by [`ApiClient`](crate::ApiClient) calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Transport or decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error status.
    #[error("API error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided message, or the raw body.
        message: String,
    },

    /// 403: the token is invalid or lacks access.
    #[error("forbidden access, token invalid or unauthorised")]
    Forbidden,

    /// The call needs a token or an email/password pair that was not given.
    #[error("no account token or email/password available")]
    MissingCredentials,
}

impl From<ApiError> for CredentialError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::MissingCredentials => CredentialError::Missing,
            other => CredentialError::Provider(anyhow::Error::new(other)),
        }
    }
}
