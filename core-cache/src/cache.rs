//! Local cache orchestration
//!
//! [`LocalCache`] ties the manifest, content store, lease table and eviction
//! policy together and exposes the operations the sync engine and display
//! consumers need.

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionPolicy, EvictionReport, QuotaShortfall};
use crate::lease::{LeaseTable, ReadLease};
use crate::manifest::{CacheManifest, ManifestChange, ManifestSnapshot};
use crate::reconcile::{self, ReconcileReport};
use crate::stats::CacheStats;
use crate::store::ContentStore;
use bridge_traits::time::Clock;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Result of offering a published download to the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The entry is live. `replaced` is the previous version, if any.
    Committed {
        replaced: Option<CacheEntry>,
        eviction: EvictionReport,
    },
    /// No room could be made; the published object was deleted.
    Rejected {
        shortfall: QuotaShortfall,
        eviction: EvictionReport,
    },
    /// The published object was gone by the time it was offered, as after a
    /// concurrent `clear`. Nothing was committed.
    Vanished,
}

/// Bounded local photo cache.
pub struct LocalCache {
    store: ContentStore,
    manifest: Arc<CacheManifest>,
    leases: LeaseTable,
    eviction: EvictionPolicy,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    /// Held by `admit` and `clear`. An object checked by `admit` cannot be
    /// swept before its entry is committed.
    admission: Mutex<()>,
}

impl LocalCache {
    /// Open the cache rooted at `root`.
    ///
    /// A corrupted manifest is rebuilt from sidecar records, or the cache is
    /// cleared if the store cannot be read. Reconciliation always runs before
    /// the cache is returned.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(
        root: impl AsRef<std::path::Path>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = ContentStore::new(root.as_ref());
        store.ensure_layout().await?;

        let manifest = match CacheManifest::load(store.manifest_path()).await {
            Ok(manifest) => manifest,
            Err(CacheError::ManifestCorruption(reason)) => {
                warn!(reason = %reason, "Cache manifest corrupted, rebuilding from sidecars");
                Self::recover(&store).await?
            }
            Err(e) => return Err(e),
        };
        let manifest = Arc::new(manifest);
        let leases = LeaseTable::new();
        let eviction = EvictionPolicy::new(
            Arc::clone(&manifest),
            store.clone(),
            leases.clone(),
            event_bus.clone(),
        );

        let cache = Self {
            store,
            manifest,
            leases,
            eviction,
            event_bus,
            clock,
            admission: Mutex::new(()),
        };
        cache.reconcile().await?;
        Ok(cache)
    }

    async fn recover(store: &ContentStore) -> Result<CacheManifest> {
        let manifest = CacheManifest::new(store.manifest_path(), ManifestSnapshot::default());
        match reconcile::rebuild_from_sidecars(store, Vec::new()).await {
            Ok(snapshot) => {
                manifest.replace(snapshot).await?;
            }
            Err(e) => {
                warn!(error = %e, "Content store unreadable, clearing cache");
                store.wipe().await?;
                manifest.replace(ManifestSnapshot::default()).await?;
            }
        }
        Ok(manifest)
    }

    /// Align manifest and store, emitting `Reconciled`.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = reconcile::reconcile(&self.manifest, &self.store).await?;
        self.emit(CacheEvent::Reconciled {
            orphans_removed: report.orphans_removed,
            entries_dropped: report.entries_dropped,
        });
        Ok(report)
    }

    pub fn manifest(&self) -> &Arc<CacheManifest> {
        &self.manifest
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn snapshot(&self) -> Arc<ManifestSnapshot> {
        self.manifest.snapshot()
    }

    /// Lease the cached file for `remote_id` and mark it as used.
    ///
    /// Returns `None` if the item is not cached or is being evicted.
    pub async fn open_entry(&self, remote_id: &str) -> Result<Option<ReadLease>> {
        let snapshot = self.manifest.snapshot();
        let Some(entry) = snapshot.get(remote_id) else {
            return Ok(None);
        };

        let lease = match self.leases.acquire(remote_id, &entry.local_path) {
            Ok(lease) => lease,
            Err(CacheError::EvictionInProgress(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        // The entry may have been replaced between the snapshot and the lease.
        let current = self.manifest.snapshot();
        if current.get(remote_id).map(|e| &e.local_path) != Some(&entry.local_path) {
            return Ok(None);
        }

        self.manifest.touch(remote_id, self.clock.now()).await?;
        Ok(Some(lease))
    }

    /// Make room for and commit a freshly published entry.
    ///
    /// On success the superseded object of a re-fetched item is deleted,
    /// unless it is leased, in which case the orphan sweep removes it later.
    #[instrument(skip(self, entry), fields(remote_id = %entry.remote_id, bytes = entry.byte_size))]
    pub async fn admit(&self, entry: CacheEntry, quota_bytes: u64) -> Result<Admission> {
        let _admission = self.admission.lock().await;
        if !self
            .store
            .object_present(&entry.local_path, entry.byte_size)
            .await?
        {
            warn!(path = %entry.local_path.display(), "Published object vanished before commit");
            self.store.delete_object(&entry.local_path).await?;
            return Ok(Admission::Vanished);
        }

        let existing = self.manifest.snapshot().get(&entry.remote_id).cloned();

        if let Some(old) = &existing {
            if old.local_path == entry.local_path {
                // Identical content re-published in place; size is unchanged.
                self.commit_entry(entry).await?;
                return Ok(Admission::Committed {
                    replaced: None,
                    eviction: EvictionReport::default(),
                });
            }
        }

        let freed = existing.as_ref().map(|e| e.byte_size).unwrap_or(0);
        let reserve = entry.byte_size.saturating_sub(freed);
        let eviction = self.eviction.enforce(quota_bytes, reserve).await?;

        let snapshot = self.manifest.snapshot();
        let still_cached = snapshot.get(&entry.remote_id).map(|e| e.byte_size).unwrap_or(0);
        let projected = snapshot.total_bytes() - still_cached + entry.byte_size;
        if projected > quota_bytes {
            warn!(projected, quota_bytes, "No room for download, discarding");
            self.store.delete_object(&entry.local_path).await?;
            let shortfall = eviction.unenforceable.unwrap_or(QuotaShortfall {
                pinned_bytes: snapshot.pinned_bytes(),
                total_bytes: snapshot.total_bytes(),
                quota_bytes,
            });
            return Ok(Admission::Rejected {
                shortfall,
                eviction,
            });
        }

        self.commit_entry(entry).await?;

        let replaced = existing.filter(|old| snapshot.contains(&old.remote_id));
        if let Some(old) = &replaced {
            self.delete_superseded(old).await;
        }
        Ok(Admission::Committed { replaced, eviction })
    }

    async fn commit_entry(&self, entry: CacheEntry) -> Result<()> {
        let remote_id = entry.remote_id.clone();
        self.manifest
            .commit(vec![
                ManifestChange::Upsert(entry),
                ManifestChange::ClearFailure { remote_id },
            ])
            .await?;
        Ok(())
    }

    async fn delete_superseded(&self, old: &CacheEntry) {
        if !self.leases.try_claim_for_eviction(&old.remote_id) {
            debug!(remote_id = %old.remote_id, "Superseded object leased, leaving it for the sweep");
            return;
        }
        if let Err(e) = self.store.delete_object(&old.local_path).await {
            warn!(remote_id = %old.remote_id, error = %e, "Failed to delete superseded object");
        }
        self.leases.release_claim(&old.remote_id);
    }

    /// Remove entries, then delete their objects unless leased.
    /// Returns the removed entries.
    pub async fn remove(&self, remote_ids: &[String]) -> Result<Vec<CacheEntry>> {
        let snapshot = self.manifest.snapshot();
        let removed: Vec<CacheEntry> = remote_ids
            .iter()
            .filter_map(|id| snapshot.get(id).cloned())
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        self.manifest
            .commit(
                removed
                    .iter()
                    .map(|e| ManifestChange::Remove {
                        remote_id: e.remote_id.clone(),
                    })
                    .collect(),
            )
            .await?;

        for entry in &removed {
            if self.leases.is_path_leased(&entry.local_path) {
                debug!(remote_id = %entry.remote_id, "Removed entry still leased, leaving object for the sweep");
                continue;
            }
            if let Err(e) = self.store.delete_object(&entry.local_path).await {
                warn!(remote_id = %entry.remote_id, error = %e, "Failed to delete removed object");
            }
        }
        Ok(removed)
    }

    /// Evict down to `quota_bytes`.
    pub async fn enforce_quota(&self, quota_bytes: u64) -> Result<EvictionReport> {
        self.eviction.enforce(quota_bytes, 0).await
    }

    /// Delete unreferenced, unleased objects.
    pub async fn sweep_orphans(&self) -> Result<u64> {
        reconcile::sweep_orphans(&self.manifest, &self.store, &self.leases.leased_paths()).await
    }

    /// Drop every entry and failure record. Leased objects survive until the
    /// next sweep.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let _admission = self.admission.lock().await;
        let active_albums = self.manifest.snapshot().active_albums().to_vec();
        self.manifest
            .replace(ManifestSnapshot::from_entries(Vec::new(), active_albums))
            .await?;
        let removed = self.sweep_orphans().await?;

        info!(removed, "Cache cleared");
        self.emit(CacheEvent::Cleared);
        Ok(())
    }

    /// Persist in-memory `last_used_at` updates.
    pub async fn flush(&self) -> Result<()> {
        self.manifest.flush().await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::from_snapshot(
            &self.manifest.snapshot(),
            self.leases.active_leases(),
            self.clock.unix_timestamp(),
        )
    }

    pub fn root(&self) -> PathBuf {
        self.store.root().to_path_buf()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.event_bus.emit(CoreEvent::Cache(event));
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("root", &self.store.root())
            .field("manifest", &self.manifest)
            .finish()
    }
}
