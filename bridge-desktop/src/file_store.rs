//! File-backed secret storage for headless display devices
//!
//! Kiosk-style devices frequently run without a Secret Service daemon, so the
//! credential is kept in a JSON document readable only by the service user.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// JSON file secret store
///
/// Values are base64 encoded under their key. Every write goes to a sibling
/// temp file that is renamed over the original, so a crash never leaves a
/// truncated token file behind.
pub struct FileSecureStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecureStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store under `<dir>/tokens.json`
    pub fn in_directory(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("tokens.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => Ok(map),
                Err(e) => {
                    // An unreadable token file means re-authorization, not a crash
                    warn!(error = %e, "Token file is corrupt, treating as empty");
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    async fn save(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to encode secrets: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = open_private(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
}

#[cfg(not(unix))]
async fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path).await
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        map.insert(key.to_string(), STANDARD.encode(value));
        self.save(&map).await?;

        debug!(key = key, "Stored secret in token file");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.load().await?;
        match map.get(key) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| BridgeError::OperationFailed(format!("Failed to decode secret: {}", e))),
            None => Ok(None),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(key).is_some() {
            self.save(&map).await?;
            debug!(key = key, "Deleted secret from token file");
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.load().await?.into_keys().collect())
    }

    async fn clear_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }
}
