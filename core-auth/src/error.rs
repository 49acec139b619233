use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The access token is expired (or inside the refresh buffer); call
    /// `refresh` before retrying.
    #[error("Access token expired")]
    Expired,

    /// The refresh token was rejected; the user must authorize again.
    #[error("Credential revoked: {0}")]
    Revoked(String),

    /// Refresh failed for a reason that may go away on its own.
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid authorization code: {0}")]
    InvalidAuthCode(String),

    #[error("No authorization in progress")]
    NoAuthorizationInProgress,

    #[error("Authorization state mismatch")]
    InvalidState,

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Stored credential is corrupted: {0}")]
    TokenCorrupted(String),

    #[error("Failed to serialize credential: {0}")]
    SerializationFailed(String),

    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },

    #[error("{0}")]
    Other(String),
}

impl AuthError {
    /// True when only a new authorization can recover.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            AuthError::NotAuthenticated | AuthError::Revoked(_) | AuthError::TokenCorrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
