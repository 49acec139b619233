use bridge_traits::catalog::CatalogError;
use core_auth::AuthError;
use core_cache::CacheError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The credential is missing, revoked, or was rejected again right
    /// after a refresh. Cycles stop until the user authorizes again.
    #[error("Authorization required: {0}")]
    AuthRequired(String),

    #[error("Credential error: {0}")]
    Credential(#[from] AuthError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Settings error: {0}")]
    Settings(#[from] core_runtime::Error),

    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: String, seconds: u64 },

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether cycles must stop until re-authorization.
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            SyncError::AuthRequired(_) => true,
            SyncError::Credential(e) => e.requires_reauthorization(),
            SyncError::Catalog(CatalogError::AuthRevoked(_)) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reauthorization_classification() {
        assert!(SyncError::AuthRequired("revoked".into()).requires_reauthorization());
        assert!(SyncError::Credential(AuthError::NotAuthenticated).requires_reauthorization());
        assert!(SyncError::Catalog(CatalogError::AuthRevoked("x".into())).requires_reauthorization());
        assert!(!SyncError::Credential(AuthError::NetworkError("down".into())).requires_reauthorization());
        assert!(!SyncError::Catalog(CatalogError::RemoteUnavailable("503".into())).requires_reauthorization());
        assert!(!SyncError::Cancelled.requires_reauthorization());
    }
}
