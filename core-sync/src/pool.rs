//! # Download Worker Pool
//!
//! Fetches the items of a [`SyncPlan`](crate::planner::SyncPlan) with bounded
//! parallelism.
//!
//! ```text
//!            ┌──────────┐   permit   ┌──────────┐
//!  to_fetch ─┤ producer ├──────────> │ worker N │── stage → verify → publish
//!            └──────────┘ Semaphore  └────┬─────┘
//!                                         │ mpsc
//!                                   ┌─────▼──────┐
//!                                   │ committer  │── admit / record failure
//!                                   └────────────┘
//! ```
//!
//! Workers never touch the manifest. They stream into a temp file, verify
//! it, write the sidecar and rename the object into place, then hand the
//! resulting [`CacheEntry`] to the single committer. The committer makes
//! room, commits, and records failures in the ledger.
//!
//! Cancelling stops the producer at once. In-flight downloads stop at the
//! next chunk and discard their temp file; results already sent are still
//! committed.

use crate::cycle::CycleId;
use crate::error::{Result, SyncError};
use bridge_traits::catalog::{CatalogError, RemoteCatalog, RemoteItem};
use bridge_traits::time::Clock;
use core_auth::TokenSource;
use core_cache::{
    extension_for, Admission, CacheEntry, ContentStore, LocalCache, ManifestChange,
    QuotaShortfall,
};
use core_runtime::config::SyncTuning;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus, SyncEvent, SyncPhase};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Totals of one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub downloaded: u64,
    pub bytes_downloaded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub parked: u64,
    /// The credential was rejected; remaining downloads were abandoned.
    pub auth_revoked: bool,
    pub cancelled: bool,
    pub quota_shortfall: Option<QuotaShortfall>,
}

/// What a worker hands to the committer.
#[derive(Debug)]
enum WorkerOutcome {
    Published(CacheEntry),
    Failed { item: RemoteItem, error: String },
    AuthRevoked(String),
    Skipped { remote_id: String, reason: String },
}

/// State shared by all workers of a pool.
struct WorkerContext {
    catalog: Arc<dyn RemoteCatalog>,
    credentials: Arc<dyn TokenSource>,
    store: ContentStore,
    clock: Arc<dyn Clock>,
    download_timeout: std::time::Duration,
}

pub struct DownloadWorkerPool {
    context: Arc<WorkerContext>,
    cache: Arc<LocalCache>,
    event_bus: EventBus,
    concurrency: usize,
    park_threshold: u32,
}

impl DownloadWorkerPool {
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        credentials: Arc<dyn TokenSource>,
        cache: Arc<LocalCache>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        tuning: &SyncTuning,
    ) -> Self {
        let context = WorkerContext {
            catalog,
            credentials,
            store: cache.store().clone(),
            clock,
            download_timeout: tuning.download_timeout,
        };
        Self {
            context: Arc::new(context),
            cache,
            event_bus,
            concurrency: tuning.download_concurrency.max(1),
            park_threshold: tuning.park_threshold,
        }
    }

    /// Download `items`, committing each as it completes.
    ///
    /// Only a manifest that cannot be written fails the run; per-item errors
    /// land in the failure ledger.
    #[instrument(skip(self, items, cancel), fields(cycle_id = %cycle_id, items = items.len()))]
    pub async fn run(
        &self,
        cycle_id: CycleId,
        items: Vec<RemoteItem>,
        quota_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<PoolReport> {
        let total = items.len() as u64;
        if total == 0 {
            return Ok(PoolReport::default());
        }

        let stop = cancel.child_token();
        let (tx, rx) = mpsc::channel::<WorkerOutcome>(self.concurrency * 2);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let producer = async {
            for item in items {
                let permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let context = Arc::clone(&self.context);
                let tx = tx.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let outcome = context.fetch(item, &stop).await;
                    let _ = tx.send(outcome).await;
                    drop(permit);
                });
            }
            drop(tx);
        };

        let committer = self.commit_outcomes(cycle_id, rx, total, quota_bytes, &stop);
        let ((), committed) = tokio::join!(producer, committer);
        let mut report = committed?;
        report.cancelled = cancel.is_cancelled();

        info!(
            downloaded = report.downloaded,
            failed = report.failed,
            skipped = report.skipped,
            rejected = report.rejected,
            "Download pool finished"
        );
        Ok(report)
    }

    async fn commit_outcomes(
        &self,
        cycle_id: CycleId,
        mut rx: mpsc::Receiver<WorkerOutcome>,
        total: u64,
        quota_bytes: u64,
        stop: &CancellationToken,
    ) -> Result<PoolReport> {
        let mut report = PoolReport::default();
        let mut fatal: Option<SyncError> = None;
        let mut done = 0u64;

        while let Some(outcome) = rx.recv().await {
            done += 1;
            if fatal.is_some() {
                if let WorkerOutcome::Published(entry) = outcome {
                    // Left for the orphan sweep of the next open.
                    debug!(remote_id = %entry.remote_id, "Dropping download after commit failure");
                }
                continue;
            }

            if let Err(e) = self.commit_one(outcome, quota_bytes, &mut report, stop).await {
                warn!(error = %e, "Manifest commit failed, stopping downloads");
                stop.cancel();
                fatal = Some(e);
                continue;
            }

            self.event_bus
                .emit(CoreEvent::Sync(SyncEvent::Progress {
                    cycle_id: cycle_id.to_string(),
                    phase: SyncPhase::Downloading,
                    items_done: done,
                    items_total: total,
                }))
                .ok();
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn commit_one(
        &self,
        outcome: WorkerOutcome,
        quota_bytes: u64,
        report: &mut PoolReport,
        stop: &CancellationToken,
    ) -> Result<()> {
        match outcome {
            WorkerOutcome::Published(entry) => {
                let bytes = entry.byte_size;
                match self.cache.admit(entry, quota_bytes).await? {
                    Admission::Committed { eviction, .. } => {
                        report.downloaded += 1;
                        report.bytes_downloaded += bytes;
                        report.evicted += eviction.evicted_count() as u64;
                        if eviction.unenforceable.is_some() {
                            report.quota_shortfall = eviction.unenforceable;
                        }
                    }
                    Admission::Rejected {
                        shortfall,
                        eviction,
                    } => {
                        report.rejected += 1;
                        report.evicted += eviction.evicted_count() as u64;
                        report.quota_shortfall = Some(shortfall);
                    }
                    Admission::Vanished => {
                        debug!("Download removed before commit, fetching again next cycle");
                        report.skipped += 1;
                    }
                }
            }
            WorkerOutcome::Failed { item, error } => {
                warn!(remote_id = %item.remote_id, error = %error, "Download failed");
                let snapshot = self
                    .cache
                    .manifest()
                    .commit(vec![ManifestChange::RecordFailure {
                        remote_id: item.remote_id.clone(),
                        fingerprint: item.fingerprint(),
                        error,
                        park_threshold: self.park_threshold,
                    }])
                    .await?;
                report.failed += 1;

                if let Some(record) = snapshot.failure(&item.remote_id) {
                    if record.parked && record.failures == self.park_threshold {
                        warn!(remote_id = %item.remote_id, failures = record.failures, "Item parked");
                        report.parked += 1;
                        self.event_bus
                            .emit(CoreEvent::Cache(CacheEvent::ItemParked {
                                remote_id: item.remote_id.clone(),
                                failures: record.failures,
                            }))
                            .ok();
                    }
                }
            }
            WorkerOutcome::AuthRevoked(message) => {
                if !report.auth_revoked {
                    warn!(message = %message, "Credential rejected, abandoning downloads");
                }
                report.auth_revoked = true;
                stop.cancel();
            }
            WorkerOutcome::Skipped { remote_id, reason } => {
                debug!(remote_id = %remote_id, reason = %reason, "Download skipped");
                report.skipped += 1;
            }
        }
        Ok(())
    }
}

impl WorkerContext {
    async fn fetch(&self, item: RemoteItem, cancel: &CancellationToken) -> WorkerOutcome {
        if cancel.is_cancelled() {
            return WorkerOutcome::Skipped {
                remote_id: item.remote_id,
                reason: "cancelled".to_string(),
            };
        }

        match self.download(&item, cancel).await {
            Ok(entry) => WorkerOutcome::Published(entry),
            Err(e) if e.is_cancelled() => WorkerOutcome::Skipped {
                remote_id: item.remote_id,
                reason: "cancelled".to_string(),
            },
            Err(e) if e.requires_reauthorization() => WorkerOutcome::AuthRevoked(e.to_string()),
            Err(SyncError::Credential(e)) => WorkerOutcome::Skipped {
                remote_id: item.remote_id,
                reason: format!("token refresh failed: {}", e),
            },
            Err(SyncError::Cache(e)) if e.is_disk_full() => {
                warn!(remote_id = %item.remote_id, error = %e, "Disk full, skipping download");
                WorkerOutcome::Skipped {
                    remote_id: item.remote_id,
                    reason: e.to_string(),
                }
            }
            Err(e) => WorkerOutcome::Failed {
                error: e.to_string(),
                item,
            },
        }
    }

    async fn download(&self, item: &RemoteItem, cancel: &CancellationToken) -> Result<CacheEntry> {
        let stream = self.open(item, cancel).await?;
        let advertised = stream.content_length;
        let mut reader = stream.reader;

        let mut staging = self.store.stage().await?;
        let copy = async {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                let read = reader.read(&mut buffer).await.map_err(|e| {
                    CatalogError::RemoteUnavailable(format!("download interrupted: {}", e))
                })?;
                if read == 0 {
                    break;
                }
                staging.write_chunk(&buffer[..read]).await?;
            }
            Ok::<(), SyncError>(())
        };

        let copied = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = timeout(self.download_timeout, copy) => result.unwrap_or_else(|_| {
                Err(SyncError::Timeout {
                    operation: "asset download".to_string(),
                    seconds: self.download_timeout.as_secs(),
                })
            }),
        };
        if let Err(e) = copied {
            staging.discard().await;
            return Err(e);
        }

        let staged = staging.finish().await?;
        let expected_size = item.byte_size.or(advertised);
        if let Err(e) = staged.verify(&item.remote_id, expected_size, item.content_hash.as_deref()) {
            staged.discard().await;
            return Err(e.into());
        }

        let extension = extension_for(item.filename.as_deref(), item.mime_type.as_deref());
        let now = self.clock.now();
        let entry = CacheEntry {
            remote_id: item.remote_id.clone(),
            album_id: item.album_id.clone(),
            local_path: self
                .store
                .object_path_for(&item.remote_id, staged.content_hash(), &extension),
            byte_size: staged.byte_size(),
            content_hash: staged.content_hash().to_string(),
            remote_version: item.fingerprint(),
            remote_modified_at: item.modified_at,
            fetched_at: now,
            last_used_at: now,
            pinned: true,
            filename: item.filename.clone(),
            mime_type: item.mime_type.clone(),
            details: item.details.clone(),
        };
        self.store.publish(staged, &entry).await?;

        debug!(remote_id = %entry.remote_id, bytes = entry.byte_size, "Downloaded");
        Ok(entry)
    }

    /// Open the asset, refreshing the credential once if it was rejected.
    async fn open(
        &self,
        item: &RemoteItem,
        cancel: &CancellationToken,
    ) -> Result<bridge_traits::catalog::AssetStream> {
        let mut refreshed = false;
        loop {
            // Request timeouts and retries belong to the catalog.
            let attempt = self.catalog.open_asset(item);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(stream) => return Ok(stream),
                Err(CatalogError::AuthExpired) if !refreshed => {
                    debug!(remote_id = %item.remote_id, "Asset request rejected, refreshing token");
                    refreshed = true;
                    self.credentials.refresh().await?;
                }
                // A fresh token that is still refused points at the item, not the credential.
                Err(e) => return Err(e.into()),
            }
        }
    }
}
