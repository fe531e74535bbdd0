use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    /// No usable provider for the tenant (missing, undecryptable or invalid key).
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("provider rate limited the request")]
    RateLimited,

    #[error("provider request failed: {0}")]
    RequestFailed(String),

    /// The provider answered but the payload did not match the expected shape.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AiError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}
