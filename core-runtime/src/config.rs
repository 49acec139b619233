//! # Core Configuration Module
//!
//! Static configuration for the sync core plus the dynamic settings that are
//! re-read at the start of every sync cycle.
//!
//! ## Overview
//!
//! [`CoreConfig`] is assembled through [`CoreConfigBuilder`] and validated
//! fail-fast: missing bridges produce an actionable
//! [`Error::CapabilityMissing`] instead of a panic deep inside a sync cycle.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - Google Photos API access and asset downloads
//! - `SecureStore` - Credential persistence
//! - `SettingsStore` - Album selection, cache quota and sync interval
//!
//! With the `desktop-shims` feature these default to `ReqwestHttpClient`,
//! a `FileSecureStore` under the data directory and a `SqliteSettingsStore`
//! at `<data_dir>/settings.db`.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, SyncTuning};
//!
//! let config = CoreConfig::builder()
//!     .cache_dir("/var/cache/lookout")
//!     .data_dir("/var/lib/lookout")
//!     .tuning(SyncTuning::default().with_download_concurrency(2))
//!     .build()?;
//! ```
//!
//! ## Dynamic settings
//!
//! The session layer writes `google.album_ids`, `google.max_cache_gb` and
//! `google.sync_interval_minutes` into the settings store at any time.
//! [`SettingsStoreSource`] reads them fresh for each cycle so a change takes
//! effect on the next run without a restart.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bridge_traits::{Clock, HttpClient, SecureStore, SettingsStore, SystemClock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Settings key holding the active album ids as a JSON array.
pub const ALBUM_IDS_KEY: &str = "google.album_ids";
/// Older single-album key, read when `google.album_ids` is absent.
pub const LEGACY_ALBUM_ID_KEY: &str = "google.album_id";
pub const MAX_CACHE_GB_KEY: &str = "google.max_cache_gb";
pub const SYNC_INTERVAL_KEY: &str = "google.sync_interval_minutes";

pub const DEFAULT_MAX_CACHE_GB: f64 = 2.0;
pub const DEFAULT_SYNC_INTERVAL_MINUTES: i64 = 60;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Core configuration for the sync engine.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root of the content store and manifest
    pub cache_dir: PathBuf,

    /// Directory for settings and credential files
    pub data_dir: PathBuf,

    pub http_client: Arc<dyn HttpClient>,
    pub secure_store: Arc<dyn SecureStore>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub clock: Arc<dyn Clock>,

    pub tuning: SyncTuning,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("cache_dir", &self.cache_dir)
            .field("data_dir", &self.data_dir)
            .field("http_client", &"HttpClient { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field("settings_store", &"SettingsStore { ... }")
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates paths and tunables.
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        self.tuning.validate()
    }
}

/// Static tunables of the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTuning {
    /// Simultaneous asset downloads
    pub download_concurrency: usize,
    /// Retries of a rate-limited or failing listing call before giving up
    pub max_listing_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Consecutive download failures after which an item is parked
    pub park_threshold: u32,
    pub listing_timeout: Duration,
    pub download_timeout: Duration,
    pub refresh_timeout: Duration,
    /// Requested pixel width of downloaded photos
    pub download_width: u32,
    pub event_buffer_size: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            max_listing_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            park_threshold: 3,
            listing_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(30),
            download_width: 1920,
            event_buffer_size: crate::events::DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl SyncTuning {
    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.download_concurrency = concurrency;
        self
    }

    pub fn with_park_threshold(mut self, threshold: u32) -> Self {
        self.park_threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_download_width(mut self, width: u32) -> Self {
        self.download_width = width;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_concurrency == 0 {
            return Err(Error::Config(
                "Download concurrency must be at least 1".to_string(),
            ));
        }

        if self.download_concurrency > 32 {
            return Err(Error::Config(
                "Download concurrency exceeds maximum of 32".to_string(),
            ));
        }

        if self.park_threshold == 0 {
            return Err(Error::Config(
                "Park threshold must be at least 1".to_string(),
            ));
        }

        if self.backoff_base > self.backoff_cap {
            return Err(Error::Config(
                "Backoff base delay cannot exceed the backoff cap".to_string(),
            ));
        }

        if self.download_width == 0 {
            return Err(Error::Config("Download width cannot be 0".to_string()));
        }

        Ok(())
    }
}

/// Settings read at the start of each sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Albums whose items must be cached, in priority order
    pub active_albums: Vec<String>,
    pub max_cache_gb: f64,
    pub sync_interval_minutes: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            active_albums: Vec::new(),
            max_cache_gb: DEFAULT_MAX_CACHE_GB,
            sync_interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
        }
    }
}

impl SyncSettings {
    /// Cache quota in bytes (GB here means 1024³ bytes).
    pub fn quota_bytes(&self) -> u64 {
        (self.max_cache_gb * BYTES_PER_GB) as u64
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.max(1) as u64 * 60)
    }
}

/// Source of [`SyncSettings`].
#[async_trait]
pub trait SyncSettingsSource: Send + Sync {
    async fn load(&self) -> Result<SyncSettings>;
}

/// Reads [`SyncSettings`] from a [`SettingsStore`].
///
/// Out-of-range numbers fall back to their defaults with a warning; an
/// unreadable store or a malformed album list is an error.
pub struct SettingsStoreSource {
    store: Arc<dyn SettingsStore>,
}

impl SettingsStoreSource {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    async fn active_albums(&self) -> Result<Vec<String>> {
        let store_error = |e: bridge_traits::BridgeError| {
            Error::Config(format!("Failed to read album selection: {}", e))
        };

        if let Some(raw) = self.store.get_string(ALBUM_IDS_KEY).await.map_err(store_error)? {
            let ids: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("{} is not a JSON array of strings: {}", ALBUM_IDS_KEY, e))
            })?;

            let mut seen = std::collections::HashSet::new();
            return Ok(ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty() && seen.insert(id.clone()))
                .collect());
        }

        match self
            .store
            .get_string(LEGACY_ALBUM_ID_KEY)
            .await
            .map_err(store_error)?
        {
            Some(id) if !id.trim().is_empty() => Ok(vec![id.trim().to_string()]),
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl SyncSettingsSource for SettingsStoreSource {
    async fn load(&self) -> Result<SyncSettings> {
        let active_albums = self.active_albums().await?;

        let max_cache_gb = match self.store.get_f64(MAX_CACHE_GB_KEY).await {
            Ok(Some(gb)) if gb.is_finite() && gb > 0.0 => gb,
            Ok(Some(gb)) => {
                warn!(value = gb, "Ignoring invalid cache quota, using default");
                DEFAULT_MAX_CACHE_GB
            }
            Ok(None) => DEFAULT_MAX_CACHE_GB,
            Err(e) => {
                warn!(error = %e, "Failed to read cache quota, using default");
                DEFAULT_MAX_CACHE_GB
            }
        };

        let sync_interval_minutes = match self.store.get_i64(SYNC_INTERVAL_KEY).await {
            Ok(Some(minutes)) if minutes >= 1 => minutes,
            Ok(Some(minutes)) => {
                warn!(value = minutes, "Ignoring invalid sync interval, using default");
                DEFAULT_SYNC_INTERVAL_MINUTES
            }
            Ok(None) => DEFAULT_SYNC_INTERVAL_MINUTES,
            Err(e) => {
                warn!(error = %e, "Failed to read sync interval, using default");
                DEFAULT_SYNC_INTERVAL_MINUTES
            }
        };

        Ok(SyncSettings {
            active_albums,
            max_cache_gb,
            sync_interval_minutes,
        })
    }
}

/// Serves settings held in memory; used by tests and fixed deployments.
#[derive(Default)]
pub struct FixedSyncSettings {
    settings: parking_lot::RwLock<SyncSettings>,
}

impl FixedSyncSettings {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings: parking_lot::RwLock::new(settings),
        }
    }

    /// Replace the settings served from the next `load` on.
    pub fn set(&self, settings: SyncSettings) {
        *self.settings.write() = settings;
    }
}

#[async_trait]
impl SyncSettingsSource for FixedSyncSettings {
    async fn load(&self) -> Result<SyncSettings> {
        Ok(self.settings.read().clone())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn capability_missing(capability: &str, message: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: message.to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new()
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(capability_missing(
        "HttpClient",
        "HttpClient implementation is required to reach the photo library. \
         Enable the 'desktop-shims' feature to use the default ReqwestHttpClient \
         or inject a platform client.",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store(data_dir: &Path) -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::FileSecureStore;

    Ok(Arc::new(FileSecureStore::in_directory(data_dir)))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store(_data_dir: &Path) -> Result<Arc<dyn SecureStore>> {
    Err(capability_missing(
        "SecureStore",
        "SecureStore implementation is required for credential persistence. \
         Enable the 'desktop-shims' feature to use the default FileSecureStore \
         or inject the device keyring.",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_store(data_dir: &Path) -> Result<Arc<dyn SettingsStore>> {
    use bridge_desktop::SqliteSettingsStore;
    use std::thread;
    use tokio::runtime::{Handle, Runtime};

    let db_path = data_dir.join("settings.db");

    let init_store = |path: PathBuf| -> Result<_> {
        let runtime = Runtime::new().map_err(|e| {
            Error::Internal(format!(
                "Failed to create Tokio runtime for default settings store: {}",
                e
            ))
        })?;

        runtime
            .block_on(SqliteSettingsStore::new(path))
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default SettingsStore: {}", e))
            })
    };

    // block_on panics inside a runtime, so build the pool on a helper thread.
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(db_path))
            .join()
            .map_err(|_| {
                Error::Internal(
                    "Worker thread panicked while creating default SettingsStore".to_string(),
                )
            })??,
        Err(_) => init_store(db_path)?,
    };

    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_store(_data_dir: &Path) -> Result<Arc<dyn SettingsStore>> {
    Err(capability_missing(
        "SettingsStore",
        "SettingsStore implementation is required for album selection and quota settings. \
         Enable the 'desktop-shims' feature to use the default SqliteSettingsStore \
         or inject the session layer's store.",
    ))
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    cache_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    clock: Option<Arc<dyn Clock>>,
    tuning: Option<SyncTuning>,
}

impl CoreConfigBuilder {
    /// Sets the cache directory holding the manifest and content store.
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the directory for settings and credential files.
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the secure store used for the OAuth credential.
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Sets the settings store the session layer writes to.
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Overrides the time source (defaults to the system clock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn tuning(mut self, tuning: SyncTuning) -> Self {
        self.tuning = Some(tuning);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when a directory is missing or a tunable is out of range
    /// - [`Error::CapabilityMissing`] when a bridge is neither injected nor
    ///   provided by `desktop-shims`
    pub fn build(self) -> Result<CoreConfig> {
        let cache_dir = self.cache_dir.ok_or_else(|| {
            Error::Config("Cache directory is required. Use .cache_dir() to set it.".to_string())
        })?;

        let data_dir = self.data_dir.ok_or_else(|| {
            Error::Config("Data directory is required. Use .data_dir() to set it.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store(&data_dir)?,
        };

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => provide_default_settings_store(&data_dir)?,
        };

        let config = CoreConfig {
            cache_dir,
            data_dir,
            http_client,
            secure_store,
            settings_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            tuning: self.tuning.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}
