//! Error types for the Google Photos provider

use bridge_traits::catalog::CatalogError;
use core_auth::AuthError;
use thiserror::Error;

/// Google Photos provider errors
#[derive(Error, Debug)]
pub enum GooglePhotosError {
    /// The API rejected the bearer token
    #[error("Authentication rejected (status {status_code})")]
    AuthenticationRejected { status_code: u16 },

    /// No usable credential could be obtained
    #[error("Credential unavailable: {0}")]
    Credential(#[from] AuthError),

    /// API request returned an error that retrying will not fix
    #[error("Google Photos API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// Album or media item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limiting, server errors or transport failures outlasted the retries
    #[error("Service unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Bridge error
    #[error(transparent)]
    BridgeError(#[from] bridge_traits::error::BridgeError),
}

/// Result type for Google Photos operations
pub type Result<T> = std::result::Result<T, GooglePhotosError>;

impl From<GooglePhotosError> for CatalogError {
    fn from(error: GooglePhotosError) -> Self {
        match error {
            GooglePhotosError::AuthenticationRejected { .. } => CatalogError::AuthExpired,
            GooglePhotosError::Credential(AuthError::Expired) => CatalogError::AuthExpired,
            GooglePhotosError::Credential(e) if e.requires_reauthorization() => {
                CatalogError::AuthRevoked(e.to_string())
            }
            GooglePhotosError::Credential(e) => CatalogError::RemoteUnavailable(e.to_string()),
            GooglePhotosError::NotFound(what) => CatalogError::NotFound(what),
            GooglePhotosError::Exhausted { .. } => {
                CatalogError::RemoteUnavailable(error.to_string())
            }
            GooglePhotosError::ApiError { .. } | GooglePhotosError::ParseError(_) => {
                CatalogError::InvalidResponse(error.to_string())
            }
            GooglePhotosError::BridgeError(e) => CatalogError::RemoteUnavailable(e.to_string()),
        }
    }
}
