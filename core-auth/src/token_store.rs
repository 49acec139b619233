//! Secure Credential Storage
//!
//! Persists the single OAuth [`Credential`] through the host's
//! [`SecureStore`]. The credential is serialized as JSON under
//! [`CREDENTIAL_KEY`].
//!
//! ## Security Features
//!
//! - Token values are never logged or placed in error messages
//! - A corrupted record is erased so the device falls back to re-authorization
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{Credential, TokenStore};
//! use chrono::Utc;
//! use std::sync::Arc;
//! # use bridge_traits::storage::SecureStore;
//! # async fn example(secure_store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let token_store = TokenStore::new(secure_store);
//!
//! let credential = Credential::from_expires_in("ya29", Some("1//0g".to_string()), 3600, Utc::now());
//! token_store.store(&credential).await?;
//! assert!(token_store.load().await?.is_some());
//! token_store.delete().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::Credential;
use bridge_traits::storage::SecureStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key of the credential record in the secure store.
pub const CREDENTIAL_KEY: &str = "lookout.credential";

/// Secure storage for the OAuth credential
#[derive(Clone)]
pub struct TokenStore {
    secure_store: Arc<dyn SecureStore>,
}

/// On-disk shape of the credential
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix seconds
    expires_at: i64,
}

impl TokenStore {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self { secure_store }
    }

    /// Store the credential, overwriting any previous one.
    pub async fn store(&self, credential: &Credential) -> Result<()> {
        let stored = StoredCredential {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            expires_at: credential.expires_at.timestamp(),
        };

        let json = serde_json::to_vec(&stored).map_err(|e| {
            warn!(error = %e, "Failed to serialize credential");
            AuthError::SerializationFailed(e.to_string())
        })?;

        self.secure_store
            .set_secret(CREDENTIAL_KEY, &json)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to store credential in secure storage");
                AuthError::SecureStorageUnavailable(e.to_string())
            })?;

        info!(
            has_refresh_token = stored.refresh_token.is_some(),
            expires_at = stored.expires_at,
            "Credential stored securely"
        );

        Ok(())
    }

    /// Load the stored credential.
    ///
    /// Returns `Ok(None)` when nothing is stored. A record that cannot be
    /// parsed is deleted and reported as [`AuthError::TokenCorrupted`].
    pub async fn load(&self) -> Result<Option<Credential>> {
        let data = self
            .secure_store
            .get_secret(CREDENTIAL_KEY)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to read credential from secure storage");
                AuthError::SecureStorageUnavailable(e.to_string())
            })?;

        let Some(data) = data else {
            debug!("No credential stored");
            return Ok(None);
        };

        let stored: StoredCredential = match serde_json::from_slice(&data) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Stored credential is corrupted, erasing it");
                if let Err(delete_err) = self.secure_store.delete_secret(CREDENTIAL_KEY).await {
                    warn!(error = %delete_err, "Failed to erase corrupted credential");
                }
                return Err(AuthError::TokenCorrupted(e.to_string()));
            }
        };

        let expires_at = DateTime::<Utc>::from_timestamp(stored.expires_at, 0)
            .ok_or_else(|| AuthError::TokenCorrupted("expiry out of range".to_string()))?;

        Ok(Some(Credential::new(
            stored.access_token,
            stored.refresh_token,
            expires_at,
        )))
    }

    /// Erase the credential. Succeeds when nothing is stored.
    pub async fn delete(&self) -> Result<()> {
        self.secure_store
            .delete_secret(CREDENTIAL_KEY)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to delete credential from secure storage");
                AuthError::SecureStorageUnavailable(e.to_string())
            })?;

        info!("Credential deleted");
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool> {
        self.secure_store
            .has_secret(CREDENTIAL_KEY)
            .await
            .map_err(|e| AuthError::SecureStorageUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        data: Mutex<HashMap<String, Vec<u8>>>,
        fail: bool,
    }

    #[async_trait]
    impl SecureStore for MemoryStore {
        async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
            if self.fail {
                return Err(BridgeError::NotAvailable("keyring locked".to_string()));
            }
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
            if self.fail {
                return Err(BridgeError::NotAvailable("keyring locked".to_string()));
            }
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }

        async fn list_keys(&self) -> BridgeResult<Vec<String>> {
            Ok(self.data.lock().unwrap().keys().cloned().collect())
        }

        async fn clear_all(&self) -> BridgeResult<()> {
            self.data.lock().unwrap().clear();
            Ok(())
        }
    }

    fn credential() -> Credential {
        Credential::new(
            "access",
            Some("refresh".to_string()),
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let store = TokenStore::new(Arc::new(MemoryStore::default()));

        assert!(store.load().await.unwrap().is_none());
        store.store(&credential()).await.unwrap();

        assert!(store.exists().await.unwrap());
        assert_eq!(store.load().await.unwrap(), Some(credential()));
    }

    #[tokio::test]
    async fn test_uses_fixed_key() {
        let backing = Arc::new(MemoryStore::default());
        let store = TokenStore::new(backing.clone());
        store.store(&credential()).await.unwrap();

        assert_eq!(backing.list_keys().await.unwrap(), vec![CREDENTIAL_KEY]);
    }

    #[tokio::test]
    async fn test_corrupted_record_is_erased() {
        let backing = Arc::new(MemoryStore::default());
        backing.set_secret(CREDENTIAL_KEY, b"{not json").await.unwrap();
        let store = TokenStore::new(backing.clone());

        let result = store.load().await;
        assert!(matches!(result, Err(AuthError::TokenCorrupted(_))));
        assert!(backing.get_secret(CREDENTIAL_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = TokenStore::new(Arc::new(MemoryStore::default()));
        store.delete().await.unwrap();
        store.store(&credential()).await.unwrap();
        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_maps_to_unavailable() {
        let store = TokenStore::new(Arc::new(MemoryStore {
            fail: true,
            ..Default::default()
        }));

        assert!(matches!(
            store.store(&credential()).await,
            Err(AuthError::SecureStorageUnavailable(_))
        ));
        assert!(matches!(
            store.load().await,
            Err(AuthError::SecureStorageUnavailable(_))
        ));
    }
}
