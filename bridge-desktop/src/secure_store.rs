//! OS keychain secret storage
//!
//! Used on devices with a session keyring (Keychain, Credential Manager,
//! Secret Service). Keyring calls block on IPC, so each one runs on the
//! blocking thread pool.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use keyring::Entry;
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_SERVICE: &str = "lookout-sync";

/// Entry holding the JSON list of keys written through this store.
const INDEX_KEY: &str = "__lookout_index";

/// Keyring-backed [`SecureStore`]
///
/// Values are base64 encoded. The keyring cannot enumerate entries, so the
/// store maintains its own index entry for `list_keys` and `clear_all`.
pub struct KeyringSecureStore {
    service_name: String,
    index_lock: Mutex<()>,
}

impl KeyringSecureStore {
    pub fn new() -> Self {
        Self::with_service_name(DEFAULT_SERVICE)
    }

    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            index_lock: Mutex::new(()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Whether a keyring backend answers at all.
    ///
    /// Headless devices without a Secret Service daemon fail here and
    /// should fall back to `FileSecureStore`.
    pub async fn is_available(&self) -> bool {
        match self.read(INDEX_KEY.to_string()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Keyring unavailable");
                false
            }
        }
    }

    async fn read(&self, key: String) -> Result<Option<String>> {
        let service = self.service_name.clone();
        blocking(move || match Entry::new(&service, &key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn write(&self, key: String, value: String) -> Result<()> {
        let service = self.service_name.clone();
        blocking(move || Entry::new(&service, &key)?.set_password(&value)).await
    }

    async fn remove(&self, key: String) -> Result<()> {
        let service = self.service_name.clone();
        blocking(move || match Entry::new(&service, &key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }

    async fn load_index(&self) -> Result<BTreeSet<String>> {
        match self.read(INDEX_KEY.to_string()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Keyring index unreadable, starting a new one");
                BTreeSet::new()
            })),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn save_index(&self, keys: &BTreeSet<String>) -> Result<()> {
        if keys.is_empty() {
            return self.remove(INDEX_KEY.to_string()).await;
        }
        let raw = serde_json::to_string(keys)
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to encode index: {}", e)))?;
        self.write(INDEX_KEY.to_string(), raw).await
    }
}

impl Default for KeyringSecureStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, keyring::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Keyring task failed: {}", e)))?
        .map_err(|e| BridgeError::OperationFailed(format!("Keyring error: {}", e)))
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        self.write(key.to_string(), STANDARD.encode(value)).await?;

        let mut index = self.load_index().await?;
        if index.insert(key.to_string()) {
            self.save_index(&index).await?;
        }
        debug!(key, "Stored secret in keyring");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(key.to_string()).await? {
            Some(encoded) => {
                let decoded = STANDARD.decode(&encoded).map_err(|e| {
                    BridgeError::OperationFailed(format!("Failed to decode secret: {}", e))
                })?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        self.remove(key.to_string()).await?;

        let mut index = self.load_index().await?;
        if index.remove(key) {
            self.save_index(&index).await?;
        }
        debug!(key, "Deleted secret from keyring");
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.load_index().await?.into_iter().collect())
    }

    async fn clear_all(&self) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        for key in self.load_index().await? {
            self.remove(key).await?;
        }
        self.remove(INDEX_KEY.to_string()).await
    }
}
