//! Shared fakes for the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::catalog::{
    AssetStream, CatalogError, CatalogPage, CatalogResult, PhotoDetails, RemoteCatalog, RemoteItem,
};
use bridge_traits::time::ManualClock;
use chrono::{DateTime, Duration, TimeZone, Utc};
use core_auth::{AuthError, TokenSource};
use core_cache::{CacheEntry, LocalCache};
use core_runtime::config::{FixedSyncSettings, SyncSettings, SyncTuning};
use core_runtime::events::{CoreEvent, EventBus, Receiver};
use core_sync::{CycleReport, CycleRunner, SyncEngine};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Fake Catalog
// ============================================================================

/// In-memory photo library paging through albums `page_size` items at a time.
/// Page tokens are item offsets.
pub struct FakeCatalog {
    page_size: usize,
    albums: Mutex<HashMap<String, Vec<RemoteItem>>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    pub page_requests: Mutex<Vec<(String, Option<String>)>>,
    pub downloads: Mutex<Vec<String>>,
    /// `(album, page index)` answered once with `AuthExpired`
    expire_once_at: Mutex<Option<(String, usize)>>,
    /// `(album, page index)` from which listing fails
    unavailable_from: Mutex<Option<(String, usize)>>,
    broken_assets: Mutex<HashSet<String>>,
    revoked: AtomicBool,
    /// Added to every call, like a catalog backing off behind rate limits
    response_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeCatalog {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            albums: Mutex::new(HashMap::new()),
            assets: Mutex::new(HashMap::new()),
            page_requests: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            expire_once_at: Mutex::new(None),
            unavailable_from: Mutex::new(None),
            broken_assets: Mutex::new(HashSet::new()),
            revoked: AtomicBool::new(false),
            response_delay: Mutex::new(None),
        }
    }

    pub fn album(&self, album_id: &str) {
        self.albums.lock().entry(album_id.to_string()).or_default();
    }

    /// Add or replace a photo. `version` becomes the etag.
    pub fn put(&self, album_id: &str, remote_id: &str, bytes: &[u8], version: &str) -> RemoteItem {
        let item = remote_item(remote_id, album_id, bytes.len() as u64, version);
        let mut albums = self.albums.lock();
        let items = albums.entry(album_id.to_string()).or_default();
        match items.iter_mut().find(|i| i.remote_id == remote_id) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        self.assets.lock().insert(remote_id.to_string(), bytes.to_vec());
        item
    }

    pub fn remove(&self, album_id: &str, remote_id: &str) {
        if let Some(items) = self.albums.lock().get_mut(album_id) {
            items.retain(|i| i.remote_id != remote_id);
        }
    }

    pub fn expire_token_once_at(&self, album_id: &str, page_index: usize) {
        *self.expire_once_at.lock() = Some((album_id.to_string(), page_index));
    }

    pub fn fail_listing_from(&self, album_id: &str, page_index: usize) {
        *self.unavailable_from.lock() = Some((album_id.to_string(), page_index));
    }

    pub fn restore_listing(&self) {
        *self.unavailable_from.lock() = None;
    }

    pub fn break_asset(&self, remote_id: &str) {
        self.broken_assets.lock().insert(remote_id.to_string());
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn slow_responses(&self, delay: std::time::Duration) {
        *self.response_delay.lock() = Some(delay);
    }

    async fn respond_later(&self) {
        let delay = *self.response_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn download_count(&self, remote_id: &str) -> usize {
        self.downloads
            .lock()
            .iter()
            .filter(|id| id.as_str() == remote_id)
            .count()
    }

    pub fn total_downloads(&self) -> usize {
        self.downloads.lock().len()
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn list_album_items(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> CatalogResult<CatalogPage> {
        self.page_requests
            .lock()
            .push((album_id.to_string(), page_token.map(str::to_string)));
        self.respond_later().await;

        if self.revoked.load(Ordering::SeqCst) {
            return Err(CatalogError::AuthRevoked("token revoked".to_string()));
        }

        let offset: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| CatalogError::InvalidResponse(token.to_string()))?,
            None => 0,
        };
        let index = offset / self.page_size;

        {
            let mut expire = self.expire_once_at.lock();
            if expire.as_ref() == Some(&(album_id.to_string(), index)) {
                *expire = None;
                return Err(CatalogError::AuthExpired);
            }
        }

        if let Some((album, from)) = self.unavailable_from.lock().as_ref() {
            if album == album_id && index >= *from {
                return Err(CatalogError::RemoteUnavailable("HTTP 503".to_string()));
            }
        }

        let items = self
            .albums
            .lock()
            .get(album_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(album_id.to_string()))?;
        let end = (offset + self.page_size).min(items.len());
        let start = offset.min(end);
        Ok(CatalogPage {
            items: items[start..end].to_vec(),
            next_page_token: (end < items.len()).then(|| end.to_string()),
        })
    }

    async fn open_asset(&self, item: &RemoteItem) -> CatalogResult<AssetStream> {
        self.downloads.lock().push(item.remote_id.clone());
        self.respond_later().await;

        if self.broken_assets.lock().contains(&item.remote_id) {
            return Err(CatalogError::RemoteUnavailable("HTTP 500".to_string()));
        }

        let bytes = self
            .assets
            .lock()
            .get(&item.remote_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(item.remote_id.clone()))?;
        Ok(AssetStream {
            content_length: Some(bytes.len() as u64),
            reader: Box::new(std::io::Cursor::new(bytes)),
        })
    }
}

// ============================================================================
// Fake Credentials
// ============================================================================

#[derive(Default)]
pub struct FakeTokens {
    pub refreshes: AtomicUsize,
    revoked: AtomicBool,
}

impl FakeTokens {
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for FakeTokens {
    async fn access_token(&self) -> core_auth::Result<String> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(AuthError::Revoked("refresh token rejected".to_string()));
        }
        Ok("access-token".to_string())
    }

    async fn refresh(&self) -> core_auth::Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.revoked.load(Ordering::SeqCst) {
            return Err(AuthError::Revoked("refresh token rejected".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()
}

pub fn remote_item(remote_id: &str, album_id: &str, size: u64, version: &str) -> RemoteItem {
    RemoteItem {
        remote_id: remote_id.to_string(),
        album_id: album_id.to_string(),
        content_hash: None,
        etag: Some(version.to_string()),
        byte_size: Some(size),
        modified_at: start_time() - Duration::days(30),
        download_url: format!("https://photos.example/{}", remote_id),
        filename: Some(format!("{}.jpg", remote_id)),
        mime_type: Some("image/jpeg".to_string()),
        details: PhotoDetails {
            description: Some(format!("Photo {}", remote_id)),
            ..PhotoDetails::default()
        },
    }
}

/// Distinct photo bytes of the given length.
pub fn photo(remote_id: &str, version: &str, len: usize) -> Vec<u8> {
    format!("{}:{};", remote_id, version)
        .bytes()
        .cycle()
        .take(len)
        .collect()
}

pub fn settings(albums: &[&str], max_cache_gb: f64) -> SyncSettings {
    SyncSettings {
        active_albums: albums.iter().map(|a| a.to_string()).collect(),
        max_cache_gb,
        sync_interval_minutes: 60,
    }
}

pub fn gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

pub struct Harness {
    pub root: PathBuf,
    pub catalog: Arc<FakeCatalog>,
    pub tokens: Arc<FakeTokens>,
    pub settings: Arc<FixedSyncSettings>,
    pub clock: Arc<ManualClock>,
    pub bus: EventBus,
    pub cache: Arc<LocalCache>,
    pub engine: SyncEngine,
}

impl Harness {
    pub async fn new(albums: &[&str], page_size: usize) -> Self {
        let root = std::env::temp_dir().join(format!("core-sync-it-{}", Uuid::new_v4()));
        let catalog = Arc::new(FakeCatalog::new(page_size));
        for album in albums {
            catalog.album(album);
        }
        let settings = Arc::new(FixedSyncSettings::new(settings(albums, 1.0)));
        let clock = Arc::new(ManualClock::new(start_time()));
        Self::open(root, catalog, Arc::new(FakeTokens::default()), settings, clock).await
    }

    async fn open(
        root: PathBuf,
        catalog: Arc<FakeCatalog>,
        tokens: Arc<FakeTokens>,
        settings: Arc<FixedSyncSettings>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let bus = EventBus::new(1024);
        let cache = Arc::new(
            LocalCache::open(&root, bus.clone(), clock.clone())
                .await
                .unwrap(),
        );
        let engine = SyncEngine::new(
            catalog.clone(),
            tokens.clone(),
            cache.clone(),
            settings.clone(),
            bus.clone(),
            clock.clone(),
            &SyncTuning::default(),
        );
        Self {
            root,
            catalog,
            tokens,
            settings,
            clock,
            bus,
            cache,
            engine,
        }
    }

    /// Drop the cache and engine and open the same directory again, as after
    /// a restart.
    pub async fn restart(self) -> Self {
        let Harness {
            root,
            catalog,
            tokens,
            settings,
            clock,
            ..
        } = self;
        Self::open(root, catalog, tokens, settings, clock).await
    }

    pub async fn cycle(&self) -> core_sync::Result<CycleReport> {
        self.engine.run_cycle(CancellationToken::new()).await
    }

    pub fn entry(&self, remote_id: &str) -> Option<CacheEntry> {
        self.cache.snapshot().get(remote_id).cloned()
    }

    pub fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Sum of object file sizes under `objects/`, sidecars excluded.
pub fn bytes_on_disk(root: &Path) -> u64 {
    fn walk(dir: &Path, total: &mut u64) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, total);
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.ends_with(".meta.json") || name.starts_with('.') {
                continue;
            }
            *total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    let mut total = 0;
    walk(&root.join("objects"), &mut total);
    total
}

pub fn drain(rx: &mut Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
