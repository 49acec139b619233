//! # Sync Engine
//!
//! Runs one sync cycle end to end:
//!
//! 1. Read the settings (album selection, quota, interval)
//! 2. Make sure the credential is usable, refreshing it if it is about to expire
//! 3. List every active album page by page
//! 4. Plan against the manifest
//! 5. Relabel and remove entries
//! 6. Download through the [`DownloadWorkerPool`]
//! 7. Enforce the quota and sweep orphaned objects
//!
//! Per-item and per-album problems are recorded in the [`CycleReport`];
//! credential and manifest errors fail the cycle. Everything committed before
//! a failure stays valid.

use crate::cycle::{CycleId, CycleReport};
use crate::error::{Result, SyncError};
use crate::planner::{RemoteSnapshot, SyncPlanner};
use crate::pool::DownloadWorkerPool;
use crate::scheduler::CycleRunner;
use async_trait::async_trait;
use bridge_traits::catalog::{CatalogError, RemoteCatalog, RemoteItem};
use bridge_traits::time::Clock;
use core_auth::{AuthError, TokenSource};
use core_cache::{LocalCache, ManifestChange};
use core_runtime::config::{SyncSettings, SyncSettingsSource, SyncTuning};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent, SyncPhase};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Items gathered from one album.
#[derive(Debug, Default)]
struct AlbumListing {
    items: Vec<RemoteItem>,
    /// Why the listing stopped early, if it did
    incomplete: Option<String>,
}

pub struct SyncEngine {
    catalog: Arc<dyn RemoteCatalog>,
    credentials: Arc<dyn TokenSource>,
    cache: Arc<LocalCache>,
    settings: Arc<dyn SyncSettingsSource>,
    pool: DownloadWorkerPool,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        credentials: Arc<dyn TokenSource>,
        cache: Arc<LocalCache>,
        settings: Arc<dyn SyncSettingsSource>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        tuning: &SyncTuning,
    ) -> Self {
        let pool = DownloadWorkerPool::new(
            Arc::clone(&catalog),
            Arc::clone(&credentials),
            Arc::clone(&cache),
            event_bus.clone(),
            Arc::clone(&clock),
            tuning,
        );
        Self {
            catalog,
            credentials,
            cache,
            settings,
            pool,
            event_bus,
            clock,
        }
    }

    #[instrument(skip(self, report, cancel), fields(cycle_id = %report.cycle_id))]
    async fn execute(&self, report: &mut CycleReport, cancel: &CancellationToken) -> Result<()> {
        let settings = self.settings.load().await?;
        let quota_bytes = settings.quota_bytes();
        self.apply_album_selection(&settings).await?;

        if settings.active_albums.is_empty() {
            warn!("No albums selected, skipping sync");
            report.skipped_reason = Some("no albums selected".to_string());
            return Ok(());
        }

        self.ensure_credential().await?;

        // Listing
        let mut remote = RemoteSnapshot::new();
        for album_id in &settings.active_albums {
            let listing = self.list_album(album_id, report.cycle_id, cancel).await?;
            let complete = listing.incomplete.is_none();
            if let Some(reason) = listing.incomplete {
                warn!(album_id = %album_id, reason = %reason, "Album listing incomplete");
                report.listing_errors.push((album_id.clone(), reason));
            }
            remote.add_album(album_id, listing.items, complete);
        }
        report.stats.listed = remote.len() as u64;

        // Planning
        self.progress(report.cycle_id, SyncPhase::Planning, 0, 1);
        let plan = SyncPlanner::plan(&remote, &self.cache.snapshot());
        report.stats.unchanged = plan.unchanged_count;
        report.stats.parked_skipped = plan.parked_count;

        let mut changes: Vec<ManifestChange> = plan
            .to_relabel
            .iter()
            .map(|(remote_id, album_id)| ManifestChange::Relabel {
                remote_id: remote_id.clone(),
                album_id: album_id.clone(),
            })
            .collect();
        changes.extend(
            plan.stale_failures
                .iter()
                .map(|remote_id| ManifestChange::ClearFailure {
                    remote_id: remote_id.clone(),
                }),
        );
        if !changes.is_empty() {
            self.cache.manifest().commit(changes).await?;
        }
        report.stats.relabeled = plan.to_relabel.len() as u64;

        // Removal
        if !plan.to_remove.is_empty() {
            self.progress(report.cycle_id, SyncPhase::Removing, 0, plan.to_remove.len() as u64);
            let removed = self.cache.remove(&plan.to_remove).await?;
            info!(count = removed.len(), "Removed entries no longer listed");
            report.stats.removed = removed.len() as u64;
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Free space ahead of downloads, e.g. after a quota reduction.
        let eviction = self.cache.enforce_quota(quota_bytes).await?;
        report.stats.evicted += eviction.evicted_count() as u64;
        report.quota_shortfall = eviction.unenforceable;

        // Downloads
        let pool = self
            .pool
            .run(report.cycle_id, plan.to_fetch, quota_bytes, cancel)
            .await?;
        report.stats.downloaded = pool.downloaded;
        report.stats.bytes_downloaded = pool.bytes_downloaded;
        report.stats.failed = pool.failed;
        report.stats.skipped = pool.skipped;
        report.stats.rejected = pool.rejected;
        report.stats.parked = pool.parked;
        report.stats.evicted += pool.evicted;
        if pool.quota_shortfall.is_some() {
            report.quota_shortfall = pool.quota_shortfall;
        }

        if pool.auth_revoked {
            return Err(SyncError::AuthRequired(
                "Credential rejected while downloading".to_string(),
            ));
        }
        if pool.cancelled {
            return Err(SyncError::Cancelled);
        }

        // Final quota check and sweep
        self.progress(report.cycle_id, SyncPhase::Evicting, 0, 1);
        let eviction = self.cache.enforce_quota(quota_bytes).await?;
        report.stats.evicted += eviction.evicted_count() as u64;
        // A rejected download keeps its shortfall even if the cache now fits.
        if eviction.unenforceable.is_some() || pool.rejected == 0 {
            report.quota_shortfall = eviction.unenforceable;
        }

        self.progress(report.cycle_id, SyncPhase::Sweeping, 0, 1);
        report.stats.orphans_removed = self.cache.sweep_orphans().await?;
        Ok(())
    }

    /// Record the active album set so pinned flags follow the selection.
    async fn apply_album_selection(&self, settings: &SyncSettings) -> Result<()> {
        let snapshot = self.cache.snapshot();
        if snapshot.active_albums() != settings.active_albums.as_slice() {
            debug!(albums = ?settings.active_albums, "Album selection changed");
            self.cache
                .manifest()
                .commit(vec![ManifestChange::SetActiveAlbums(
                    settings.active_albums.clone(),
                )])
                .await?;
        }
        Ok(())
    }

    /// Fail fast without a usable credential; refresh one about to expire.
    async fn ensure_credential(&self) -> Result<()> {
        match self.credentials.access_token().await {
            Ok(_) => Ok(()),
            Err(AuthError::Expired) => {
                debug!("Access token expiring, refreshing before listing");
                self.refresh().await
            }
            Err(e) if e.requires_reauthorization() => Err(SyncError::AuthRequired(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&self) -> Result<()> {
        match self.credentials.refresh().await {
            Ok(()) => Ok(()),
            Err(e) if e.requires_reauthorization() => Err(SyncError::AuthRequired(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// List an album page by page.
    ///
    /// A rejected token is refreshed once and the same page requested again.
    /// Remote failures end the listing early without failing the cycle.
    async fn list_album(
        &self,
        album_id: &str,
        cycle_id: CycleId,
        cancel: &CancellationToken,
    ) -> Result<AlbumListing> {
        let mut listing = AlbumListing::default();
        let mut page_token: Option<String> = None;
        let mut pages = 0u64;
        let mut refreshed = false;

        loop {
            // The catalog bounds each request and retries on its own.
            let call = self.catalog.list_album_items(album_id, page_token.as_deref());
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = call => result,
            };

            match result {
                Ok(page) => {
                    refreshed = false;
                    pages += 1;
                    let last = page.is_last();
                    listing.items.extend(page.items);
                    self.progress(
                        cycle_id,
                        SyncPhase::Listing,
                        listing.items.len() as u64,
                        listing.items.len() as u64,
                    );
                    if last {
                        debug!(album_id = %album_id, pages, items = listing.items.len(), "Album listed");
                        return Ok(listing);
                    }
                    page_token = page.next_page_token;
                }
                Err(CatalogError::AuthExpired) if !refreshed => {
                    info!(album_id = %album_id, page = pages + 1, "Token rejected mid-listing, refreshing");
                    refreshed = true;
                    self.refresh().await?;
                }
                Err(CatalogError::AuthExpired) => {
                    return Err(SyncError::AuthRequired(
                        "Access token rejected after refresh".to_string(),
                    ));
                }
                Err(CatalogError::AuthRevoked(message)) => {
                    return Err(SyncError::AuthRequired(message));
                }
                Err(e) => {
                    listing.incomplete = Some(e.to_string());
                    return Ok(listing);
                }
            }
        }
    }

    fn progress(&self, cycle_id: CycleId, phase: SyncPhase, items_done: u64, items_total: u64) {
        self.emit(SyncEvent::Progress {
            cycle_id: cycle_id.to_string(),
            phase,
            items_done,
            items_total,
        });
    }

    fn emit(&self, event: SyncEvent) {
        self.event_bus.emit(CoreEvent::Sync(event)).ok();
    }
}

#[async_trait]
impl CycleRunner for SyncEngine {
    async fn run_cycle(&self, cancel: CancellationToken) -> Result<CycleReport> {
        let cycle_id = CycleId::new();
        let mut report = CycleReport::new(cycle_id, self.clock.now());
        info!(cycle_id = %cycle_id, "Sync cycle started");
        self.emit(SyncEvent::Started {
            cycle_id: cycle_id.to_string(),
        });

        let result = self.execute(&mut report, &cancel).await;
        report.finished_at = self.clock.now();

        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "Failed to persist last-used times");
        }

        match result {
            Ok(()) => {
                info!(
                    cycle_id = %cycle_id,
                    downloaded = report.stats.downloaded,
                    removed = report.stats.removed,
                    evicted = report.stats.evicted,
                    failed = report.stats.failed,
                    duration_ms = report.duration_ms(),
                    "Sync cycle completed"
                );
                self.emit(SyncEvent::Completed {
                    cycle_id: cycle_id.to_string(),
                    downloaded: report.stats.downloaded,
                    failed: report.stats.failed,
                    removed: report.stats.removed,
                    relabeled: report.stats.relabeled,
                    evicted: report.stats.evicted,
                    parked: report.stats.parked,
                    duration_ms: report.duration_ms(),
                });
                Ok(report)
            }
            Err(SyncError::Cancelled) => {
                info!(cycle_id = %cycle_id, "Sync cycle cancelled");
                self.emit(SyncEvent::Cancelled {
                    cycle_id: cycle_id.to_string(),
                });
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                error!(cycle_id = %cycle_id, error = %e, "Sync cycle failed");
                self.emit(SyncEvent::Failed {
                    cycle_id: cycle_id.to_string(),
                    message: e.to_string(),
                    recoverable: !e.requires_reauthorization(),
                });
                Err(e)
            }
        }
    }

    async fn interval(&self) -> Duration {
        match self.settings.load().await {
            Ok(settings) => settings.sync_interval(),
            Err(e) => {
                warn!(error = %e, "Failed to read sync interval, using default");
                SyncSettings::default().sync_interval()
            }
        }
    }
}
