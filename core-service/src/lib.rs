//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, secure
//! storage, settings, clock) into the sync core and exposes the handful of
//! operations a slideshow host needs: start a sync, read the cached photos,
//! report status and drive the authorization flow. Desktop hosts typically
//! enable the `desktop-shims` feature (which depends on `bridge-desktop`) and
//! call [`desktop_config`] to get default bridges under the platform
//! directories.
//!
//! ```ignore
//! use core_auth::OAuthConfig;
//! use core_service::{desktop_config, AppDirectories, CoreService, SecretBackend};
//!
//! let config = desktop_config(&AppDirectories::resolve(), SecretBackend::File).await?;
//! let oauth = OAuthConfig::google_photos(client_id, None, redirect_uri);
//! let service = CoreService::bootstrap(config, oauth).await?;
//! service.start();
//!
//! for entry in service.current_entries(None) {
//!     println!("{}", entry.local_path.display());
//! }
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::catalog::{CatalogError, RemoteAlbum, RemoteCatalog};
use chrono::{DateTime, Utc};
use core_auth::{
    CredentialState, CredentialStore, OAuthConfig, OAuthFlowManager, TokenSource, TokenStore,
};
use core_cache::{CacheEntry, CacheStats, LocalCache, ReadLease};
use core_runtime::config::{
    CoreConfig, SettingsStoreSource, SyncSettings, SyncSettingsSource,
};
use core_runtime::events::{EventBus, EventStream};
use core_sync::{SchedulerState, SyncEngine, SyncScheduler, TriggerOutcome};
use provider_google_photos::{CatalogConfig, GooglePhotosCatalog};
use serde::Serialize;
use tracing::{info, instrument, warn};

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop::AppDirectories;

/// Snapshot of sync progress and cache usage for the host UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SchedulerState,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bytes_used: u64,
    pub quota_bytes: u64,
}

struct ServiceInner {
    event_bus: EventBus,
    cache: Arc<LocalCache>,
    credentials: Arc<CredentialStore>,
    catalog: Arc<dyn RemoteCatalog>,
    settings: Arc<dyn SyncSettingsSource>,
    scheduler: SyncScheduler,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<ServiceInner>,
}

impl CoreService {
    /// Build the service against the Google Photos Library API.
    ///
    /// The cache is opened and reconciled before this returns, so
    /// [`current_entries`](Self::current_entries) is usable immediately.
    /// Call [`start`](Self::start) to begin periodic syncing.
    pub async fn bootstrap(config: CoreConfig, oauth: OAuthConfig) -> Result<Self> {
        let http_client = config.http_client.clone();
        let catalog_config = CatalogConfig::from_tuning(&config.tuning);
        Self::bootstrap_with_catalog(config, oauth, move |tokens| -> Arc<dyn RemoteCatalog> {
            Arc::new(GooglePhotosCatalog::new(http_client, tokens, catalog_config))
        })
        .await
    }

    /// Build the service with a caller-supplied catalog.
    ///
    /// `make_catalog` receives the credential store as the token source the
    /// catalog should authenticate with.
    #[instrument(skip_all, fields(cache_dir = %config.cache_dir.display()))]
    pub async fn bootstrap_with_catalog<F>(
        config: CoreConfig,
        oauth: OAuthConfig,
        make_catalog: F,
    ) -> Result<Self>
    where
        F: FnOnce(Arc<dyn TokenSource>) -> Arc<dyn RemoteCatalog>,
    {
        config.validate()?;
        let tuning = config.tuning.clone();
        let event_bus = EventBus::new(tuning.event_buffer_size);

        let cache = Arc::new(
            LocalCache::open(&config.cache_dir, event_bus.clone(), config.clock.clone()).await?,
        );

        let flow = OAuthFlowManager::new(oauth, config.http_client.clone())
            .with_request_timeout(tuning.refresh_timeout);
        let credentials = Arc::new(
            CredentialStore::new(
                TokenStore::new(config.secure_store.clone()),
                flow,
                event_bus.clone(),
                config.clock.clone(),
            )
            .with_refresh_timeout(tuning.refresh_timeout),
        );
        let credential_state = credentials.load().await?;

        let tokens: Arc<dyn TokenSource> = credentials.clone();
        let catalog = make_catalog(tokens);
        let settings: Arc<dyn SyncSettingsSource> =
            Arc::new(SettingsStoreSource::new(config.settings_store.clone()));

        let engine = SyncEngine::new(
            catalog.clone(),
            credentials.clone(),
            cache.clone(),
            settings.clone(),
            event_bus.clone(),
            config.clock.clone(),
            &tuning,
        );
        let scheduler = SyncScheduler::new(Arc::new(engine), config.clock.clone());
        if credential_state.needs_authorization() {
            scheduler.require_authorization(format!("Credential {}", credential_state));
        }

        info!(
            credential = %credential_state,
            entries = cache.snapshot().len(),
            "Core service ready"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                event_bus,
                cache,
                credentials,
                catalog,
                settings,
                scheduler,
            }),
        })
    }

    /// Start the interval timer. The first cycle is triggered right away.
    pub fn start(&self) {
        self.inner.scheduler.start();
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Request a sync cycle now.
    pub fn trigger_sync(&self) -> TriggerOutcome {
        let outcome = self.inner.scheduler.trigger();
        info!(outcome = ?outcome, "Sync requested");
        outcome
    }

    /// Scheduler state plus cache usage against the configured quota.
    pub async fn sync_status(&self) -> SyncStatus {
        let status = self.inner.scheduler.status();
        let quota_bytes = self.settings().await.quota_bytes();
        SyncStatus {
            state: status.state,
            last_cycle_at: status.last_cycle_at,
            last_error: status.last_error,
            bytes_used: self.inner.cache.snapshot().total_bytes(),
            quota_bytes,
        }
    }

    /// Resolves once no cycle is running.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    // ========================================================================
    // Cache
    // ========================================================================

    /// Cached photos, optionally restricted to one album, ordered by fetch
    /// time then remote id.
    pub fn current_entries(&self, album_id: Option<&str>) -> Vec<CacheEntry> {
        self.inner.cache.snapshot().entries_for_album(album_id)
    }

    /// Open a cached photo for display. The file is protected from eviction
    /// until the returned lease is dropped.
    pub async fn open_entry(&self, remote_id: &str) -> Result<Option<ReadLease>> {
        Ok(self.inner.cache.open_entry(remote_id).await?)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop every cached photo. The album selection is kept, so the next
    /// cycle downloads everything again.
    pub async fn clear_cache(&self) -> Result<()> {
        Ok(self.inner.cache.clear().await?)
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Consent URL for the photo library. Open it in a browser and pass the
    /// redirected `code` and `state` to
    /// [`complete_authorization`](Self::complete_authorization).
    pub async fn authorization_url(&self) -> Result<String> {
        Ok(self.inner.credentials.authorization_url().await?)
    }

    /// Exchange the authorization code and resume syncing.
    #[instrument(skip(self, code, state))]
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<()> {
        self.inner
            .credentials
            .complete_authorization(code, state)
            .await?;
        let outcome = self.inner.scheduler.reauthorized();
        info!(outcome = ?outcome, "Authorization completed");
        Ok(())
    }

    pub async fn credential_state(&self) -> CredentialState {
        self.inner.credentials.state().await
    }

    /// Erase the stored credential. Cached photos stay available; syncing
    /// stops until the next authorization.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        self.inner.credentials.sign_out().await?;
        self.inner.scheduler.require_authorization("Signed out");
        Ok(())
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Albums of the signed-in user, for the album picker.
    #[instrument(skip(self))]
    pub async fn list_albums(&self) -> Result<Vec<RemoteAlbum>> {
        match self.inner.catalog.list_albums().await {
            Err(CatalogError::AuthExpired) => {
                self.inner.credentials.refresh().await?;
                Ok(self.inner.catalog.list_albums().await?)
            }
            other => Ok(other?),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.inner.event_bus.subscribe())
    }

    /// Stop the timer, cancel a running cycle and persist cache bookkeeping.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.scheduler.shutdown().await;
        self.inner.cache.flush().await?;
        info!("Core service stopped");
        Ok(())
    }

    async fn settings(&self) -> SyncSettings {
        match self.inner.settings.load().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to read sync settings, using defaults");
                SyncSettings::default()
            }
        }
    }
}

/// Where the desktop bridges keep the OAuth credential.
#[cfg(feature = "desktop-shims")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretBackend {
    /// `tokens.json` under the data directory
    #[default]
    File,
    /// OS keyring, or the token file when no keyring answers
    Keyring,
}

/// Configuration with the desktop bridges rooted at `dirs`.
#[cfg(feature = "desktop-shims")]
pub async fn desktop_config(dirs: &AppDirectories, secrets: SecretBackend) -> Result<CoreConfig> {
    use bridge_desktop::{FileSecureStore, KeyringSecureStore, SqliteSettingsStore};
    use bridge_traits::storage::SecureStore;

    tokio::fs::create_dir_all(&dirs.data_dir)
        .await
        .map_err(|e| {
            CoreError::InitializationFailed(format!(
                "Failed to create data directory {}: {}",
                dirs.data_dir.display(),
                e
            ))
        })?;

    let file_store = || -> Arc<dyn SecureStore> {
        Arc::new(FileSecureStore::in_directory(dirs.tokens_dir()))
    };
    let secure_store = match secrets {
        SecretBackend::File => file_store(),
        SecretBackend::Keyring => {
            let keyring = KeyringSecureStore::new();
            if keyring.is_available().await {
                Arc::new(keyring) as Arc<dyn SecureStore>
            } else {
                warn!("Keyring unavailable, keeping the credential in the token file");
                file_store()
            }
        }
    };

    let settings_store = SqliteSettingsStore::new(dirs.settings_db())
        .await
        .map_err(|e| CoreError::InitializationFailed(format!("Failed to open settings: {}", e)))?;

    Ok(CoreConfig::builder()
        .cache_dir(dirs.cache_dir.clone())
        .data_dir(dirs.data_dir.clone())
        .secure_store(secure_store)
        .settings_store(Arc::new(settings_store))
        .build()?)
}
