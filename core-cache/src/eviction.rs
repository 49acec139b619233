//! Quota enforcement

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::lease::LeaseTable;
use crate::manifest::{CacheManifest, ManifestChange};
use crate::store::ContentStore;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Overage that no eligible eviction could remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaShortfall {
    pub pinned_bytes: u64,
    pub total_bytes: u64,
    pub quota_bytes: u64,
}

impl From<QuotaShortfall> for CacheError {
    fn from(shortfall: QuotaShortfall) -> Self {
        CacheError::QuotaUnenforceable {
            pinned_bytes: shortfall.pinned_bytes,
            total_bytes: shortfall.total_bytes,
            quota_bytes: shortfall.quota_bytes,
        }
    }
}

/// Outcome of one `enforce` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// `(remote_id, bytes)` in eviction order
    pub evicted: Vec<(String, u64)>,
    pub bytes_freed: u64,
    pub unenforceable: Option<QuotaShortfall>,
}

impl EvictionReport {
    pub fn evicted_count(&self) -> usize {
        self.evicted.len()
    }

    pub fn is_enforced(&self) -> bool {
        self.unenforceable.is_none()
    }
}

/// Least-recently-used eviction over unpinned, unleased entries.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    manifest: Arc<CacheManifest>,
    store: ContentStore,
    leases: LeaseTable,
    event_bus: EventBus,
}

impl EvictionPolicy {
    pub fn new(
        manifest: Arc<CacheManifest>,
        store: ContentStore,
        leases: LeaseTable,
        event_bus: EventBus,
    ) -> Self {
        Self {
            manifest,
            store,
            leases,
            event_bus,
        }
    }

    /// Evict until `total_bytes <= quota_bytes - reserve_bytes`.
    ///
    /// Victims are claimed in the lease table and their file moved aside
    /// before their entry is removed. The file is put back if the removal
    /// cannot be committed. A victim that cannot be evicted is skipped.
    /// Any overage left afterwards is reported, emitted and logged.
    #[instrument(skip(self))]
    pub async fn enforce(&self, quota_bytes: u64, reserve_bytes: u64) -> Result<EvictionReport> {
        let target = quota_bytes.saturating_sub(reserve_bytes);
        let mut report = EvictionReport::default();

        let snapshot = self.manifest.snapshot();
        if snapshot.total_bytes() <= target {
            return Ok(report);
        }

        let candidates = self.candidates(snapshot.entries());
        debug!(
            total_bytes = snapshot.total_bytes(),
            target,
            candidates = candidates.len(),
            "Enforcing cache quota"
        );

        let mut total = snapshot.total_bytes();
        for victim in candidates {
            if total <= target {
                break;
            }
            if !self.leases.try_claim_for_eviction(&victim.remote_id) {
                debug!(remote_id = %victim.remote_id, "Victim leased, skipping");
                continue;
            }

            let evicted = self.evict(&victim).await;
            self.leases.release_claim(&victim.remote_id);

            match evicted {
                Ok(()) => {
                    total = total.saturating_sub(victim.byte_size);
                    report.bytes_freed += victim.byte_size;
                    report.evicted.push((victim.remote_id.clone(), victim.byte_size));
                    self.emit(CacheEvent::Evicted {
                        remote_id: victim.remote_id.clone(),
                        bytes: victim.byte_size,
                    });
                }
                Err(e) => {
                    warn!(remote_id = %victim.remote_id, error = %e, "Failed to evict entry, trying next");
                }
            }
        }

        let snapshot = self.manifest.snapshot();
        if snapshot.total_bytes() > target {
            let shortfall = QuotaShortfall {
                pinned_bytes: snapshot.pinned_bytes(),
                total_bytes: snapshot.total_bytes(),
                quota_bytes,
            };
            warn!(
                pinned_bytes = shortfall.pinned_bytes,
                total_bytes = shortfall.total_bytes,
                quota_bytes,
                reserve_bytes,
                "Cache quota cannot be enforced"
            );
            self.emit(CacheEvent::QuotaUnenforceable {
                pinned_bytes: shortfall.pinned_bytes,
                total_bytes: shortfall.total_bytes,
                quota_bytes,
            });
            report.unenforceable = Some(shortfall);
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                bytes_freed = report.bytes_freed,
                "Evicted cache entries"
            );
        }
        Ok(report)
    }

    /// Unpinned, unleased entries in eviction order.
    fn candidates<'a>(&self, entries: impl Iterator<Item = &'a CacheEntry>) -> Vec<CacheEntry> {
        let mut candidates: Vec<CacheEntry> = entries
            .filter(|e| !e.pinned && !self.leases.is_leased(&e.remote_id))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| b.byte_size.cmp(&a.byte_size))
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });
        candidates
    }

    async fn evict(&self, victim: &CacheEntry) -> Result<()> {
        let detached = self.store.detach_object(&victim.local_path).await?;
        let committed = self
            .manifest
            .commit(vec![ManifestChange::Remove {
                remote_id: victim.remote_id.clone(),
            }])
            .await;

        if let Err(e) = committed {
            if let Err(restore) = detached.restore().await {
                error!(
                    remote_id = %victim.remote_id,
                    error = %restore,
                    "Failed to restore object after aborted eviction"
                );
            }
            return Err(e);
        }
        detached.discard().await;
        Ok(())
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.event_bus.emit(CoreEvent::Cache(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestSnapshot;
    use chrono::{Duration, TimeZone, Utc};
    use std::path::PathBuf;
    use uuid::Uuid;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        root: PathBuf,
        store: ContentStore,
        manifest: Arc<CacheManifest>,
        leases: LeaseTable,
        bus: EventBus,
    }

    impl Fixture {
        async fn new() -> Self {
            let root = std::env::temp_dir().join(format!("core-cache-evict-{}", Uuid::new_v4()));
            let store = ContentStore::new(&root);
            store.ensure_layout().await.unwrap();
            let manifest = Arc::new(CacheManifest::new(
                store.manifest_path(),
                ManifestSnapshot::default(),
            ));
            Self {
                root,
                store,
                manifest,
                leases: LeaseTable::new(),
                bus: EventBus::new(32),
            }
        }

        fn policy(&self) -> EvictionPolicy {
            EvictionPolicy::new(
                Arc::clone(&self.manifest),
                self.store.clone(),
                self.leases.clone(),
                self.bus.clone(),
            )
        }

        /// Insert an entry with a real (small) file but a declared size.
        async fn add(&self, remote_id: &str, album_id: &str, size: u64, used_minute: i64) -> CacheEntry {
            let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(used_minute);
            let hash = format!("{:0>64}", remote_id.len());
            let path = self.store.object_path_for(remote_id, &hash, "jpg");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, remote_id.as_bytes()).unwrap();

            let entry = CacheEntry {
                remote_id: remote_id.to_string(),
                album_id: album_id.to_string(),
                local_path: path,
                byte_size: size,
                content_hash: hash,
                remote_version: "etag:1".to_string(),
                remote_modified_at: at,
                fetched_at: at,
                last_used_at: at,
                pinned: false,
                filename: None,
                mime_type: None,
                details: Default::default(),
            };
            self.manifest
                .commit(vec![ManifestChange::Upsert(entry.clone())])
                .await
                .unwrap();
            entry
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn test_no_eviction_under_quota() {
        let fx = Fixture::new().await;
        fx.add("a", "x", 10, 0).await;

        let report = fx.policy().enforce(100, 0).await.unwrap();
        assert_eq!(report, EvictionReport::default());
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used_first() {
        let fx = Fixture::new().await;
        let oldest = fx.add("old", "x", 40, 0).await;
        fx.add("mid", "x", 40, 5).await;
        fx.add("new", "x", 40, 10).await;
        let mut events = fx.bus.subscribe();

        let report = fx.policy().enforce(100, 0).await.unwrap();

        assert_eq!(report.evicted, vec![("old".to_string(), 40)]);
        assert!(report.is_enforced());
        assert_eq!(fx.manifest.snapshot().total_bytes(), 80);
        assert!(!oldest.local_path.exists());
        assert!(!ContentStore::sidecar_path(&oldest.local_path).exists());
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Cache(CacheEvent::Evicted {
                remote_id: "old".to_string(),
                bytes: 40
            })
        );
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_ties_prefer_larger_then_remote_id() {
        let fx = Fixture::new().await;
        fx.add("b", "x", 10, 0).await;
        fx.add("a", "x", 10, 0).await;
        fx.add("big", "x", 30, 0).await;

        let report = fx.policy().enforce(15, 0).await.unwrap();
        let order: Vec<&str> = report.evicted.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["big", "a"]);
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_reserve_makes_room_for_incoming() {
        let fx = Fixture::new().await;
        fx.manifest
            .commit(vec![ManifestChange::SetActiveAlbums(vec!["x".into()])])
            .await
            .unwrap();
        fx.add("p1", "x", 100 * MB, 0).await;
        fx.add("u1", "old", 95 * MB, 1).await;
        fx.add("u2", "old", 5 * MB, 2).await;

        // 200 MB cached, quota 210 MB, 20 MB incoming
        let report = fx.policy().enforce(210 * MB, 20 * MB).await.unwrap();

        assert_eq!(report.evicted, vec![("u1".to_string(), 95 * MB)]);
        assert!(report.is_enforced());
        assert_eq!(fx.manifest.snapshot().total_bytes(), 105 * MB);
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_pinned_and_leased_are_never_evicted() {
        let fx = Fixture::new().await;
        fx.manifest
            .commit(vec![ManifestChange::SetActiveAlbums(vec!["x".into()])])
            .await
            .unwrap();
        let pinned = fx.add("pinned", "x", 60, 0).await;
        let leased = fx.add("leased", "old", 60, 1).await;
        let _lease = fx.leases.acquire("leased", &leased.local_path).unwrap();
        let mut events = fx.bus.subscribe();

        let report = fx.policy().enforce(50, 0).await.unwrap();

        assert!(report.evicted.is_empty());
        assert_eq!(
            report.unenforceable,
            Some(QuotaShortfall {
                pinned_bytes: 60,
                total_bytes: 120,
                quota_bytes: 50
            })
        );
        assert!(pinned.local_path.exists());
        assert!(leased.local_path.exists());
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Cache(CacheEvent::QuotaUnenforceable {
                pinned_bytes: 60,
                total_bytes: 120,
                quota_bytes: 50
            })
        );
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_failed_commit_puts_victim_back() {
        let fx = Fixture::new().await;
        let victim = fx.add("victim", "x", 60, 0).await;
        // A directory in place of the manifest makes every commit fail.
        let manifest_path = fx.store.manifest_path();
        let _ = std::fs::remove_file(&manifest_path);
        std::fs::create_dir_all(manifest_path.join("blocker")).unwrap();

        let report = fx.policy().enforce(50, 0).await.unwrap();

        assert!(report.evicted.is_empty());
        assert!(report.unenforceable.is_some());
        assert!(fx.manifest.snapshot().contains("victim"));
        assert_eq!(std::fs::read(&victim.local_path).unwrap(), b"victim");
        assert_eq!(std::fs::read_dir(fx.store.tmp_dir()).unwrap().count(), 0);
        assert!(fx.leases.try_claim_for_eviction("victim"));
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_undeletable_sidecar_does_not_block_eviction() {
        let fx = Fixture::new().await;
        let victim = fx.add("victim", "x", 60, 0).await;
        std::fs::create_dir_all(ContentStore::sidecar_path(&victim.local_path).join("stuck")).unwrap();

        let report = fx.policy().enforce(50, 0).await.unwrap();

        assert_eq!(report.evicted, vec![("victim".to_string(), 60)]);
        assert!(report.is_enforced());
        assert!(!fx.manifest.snapshot().contains("victim"));
        assert!(!victim.local_path.exists());
        assert_eq!(std::fs::read_dir(fx.store.tmp_dir()).unwrap().count(), 0);
        fx.cleanup();
    }

    #[tokio::test]
    async fn test_missing_victim_file_is_still_removed() {
        let fx = Fixture::new().await;
        let victim = fx.add("victim", "x", 60, 0).await;
        std::fs::remove_file(&victim.local_path).unwrap();

        let report = fx.policy().enforce(50, 0).await.unwrap();

        assert_eq!(report.evicted, vec![("victim".to_string(), 60)]);
        assert!(fx.manifest.snapshot().is_empty());
        fx.cleanup();
    }

    #[test]
    fn test_shortfall_converts_to_error() {
        let error: CacheError = QuotaShortfall {
            pinned_bytes: 1,
            total_bytes: 2,
            quota_bytes: 1,
        }
        .into();
        assert!(matches!(error, CacheError::QuotaUnenforceable { total_bytes: 2, .. }));
    }
}
