//! Integration tests for the download worker pool and eviction interplay
//!
//! The cache is pre-seeded directly so that unpinned, leased and pinned
//! entries can be arranged precisely before a download is committed.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use core_cache::{CacheEntry, LocalCache, ManifestChange};
use core_runtime::config::SyncTuning;
use core_sync::{CycleId, DownloadWorkerPool};
use tokio_util::sync::CancellationToken;

const KIB: u64 = 1024;

/// Publish and commit `size` bytes for `remote_id`, last used `minute`
/// minutes after 08:00.
async fn seed(cache: &LocalCache, remote_id: &str, album_id: &str, size: u64, minute: i64) -> CacheEntry {
    let mut staging = cache.store().stage().await.unwrap();
    staging
        .write_chunk(&photo(remote_id, "seed", size as usize))
        .await
        .unwrap();
    let staged = staging.finish().await.unwrap();
    let at = Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap() + Duration::minutes(minute);
    let entry = CacheEntry {
        remote_id: remote_id.to_string(),
        album_id: album_id.to_string(),
        local_path: cache
            .store()
            .object_path_for(remote_id, staged.content_hash(), "jpg"),
        byte_size: staged.byte_size(),
        content_hash: staged.content_hash().to_string(),
        remote_version: "etag:seed".to_string(),
        remote_modified_at: at,
        fetched_at: at,
        last_used_at: at,
        pinned: false,
        filename: None,
        mime_type: None,
        details: Default::default(),
    };
    cache.store().publish(staged, &entry).await.unwrap();
    cache.admit(entry.clone(), u64::MAX).await.unwrap();
    entry
}

async fn activate(cache: &LocalCache, albums: &[&str]) {
    cache
        .manifest()
        .commit(vec![ManifestChange::SetActiveAlbums(
            albums.iter().map(|a| a.to_string()).collect(),
        )])
        .await
        .unwrap();
}

fn pool(h: &Harness) -> DownloadWorkerPool {
    DownloadWorkerPool::new(
        h.catalog.clone(),
        h.tokens.clone(),
        h.cache.clone(),
        h.bus.clone(),
        h.clock.clone(),
        &SyncTuning::default(),
    )
}

#[tokio::test]
async fn test_new_download_evicts_least_recently_used_until_it_fits() {
    let h = Harness::new(&["a"], 10).await;
    activate(&h.cache, &["a"]).await;
    // 95 KiB of unpinned history, oldest first.
    let mut seeded = Vec::new();
    for i in 0..5 {
        seeded.push(seed(&h.cache, &format!("old-{}", i), "archive", 19 * KIB, i).await);
    }
    assert_eq!(h.cache.snapshot().total_bytes(), 95 * KIB);

    let item = h.catalog.put("a", "fresh", &photo("fresh", "v1", 20 * 1024), "v1");
    let quota = 100 * KIB;
    let report = pool(&h)
        .run(CycleId::new(), vec![item], quota, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(report.evicted, 1);
    assert!(report.quota_shortfall.is_none());
    let snapshot = h.cache.snapshot();
    assert!(snapshot.contains("fresh"));
    assert!(!snapshot.contains("old-0"));
    assert!(!seeded[0].local_path.exists());
    for entry in &seeded[1..] {
        assert!(snapshot.contains(&entry.remote_id));
    }
    assert_eq!(snapshot.total_bytes(), 4 * 19 * KIB + 20 * KIB);
    assert!(snapshot.total_bytes() <= quota);
    assert_eq!(snapshot.total_bytes(), bytes_on_disk(&h.root));

    h.cleanup();
}

#[tokio::test]
async fn test_eviction_skips_leased_and_pinned_entries() {
    let h = Harness::new(&["a"], 10).await;
    activate(&h.cache, &["a"]).await;
    let pinned = seed(&h.cache, "pinned", "a", 30 * KIB, 0).await;
    let leased = seed(&h.cache, "leased", "archive", 30 * KIB, 1).await;
    let victim = seed(&h.cache, "victim", "archive", 30 * KIB, 2).await;

    // Keep the leased entry the least recently used one.
    h.clock.set(Utc.with_ymd_and_hms(2024, 9, 1, 7, 0, 0).unwrap());
    let lease = h.cache.open_entry("leased").await.unwrap().unwrap();

    let item = h.catalog.put("a", "fresh", &photo("fresh", "v1", 20 * 1024), "v1");
    let report = pool(&h)
        .run(CycleId::new(), vec![item], 100 * KIB, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    let snapshot = h.cache.snapshot();
    assert!(snapshot.contains("pinned"));
    assert!(snapshot.contains("leased"));
    assert!(!snapshot.contains("victim"));
    assert!(pinned.local_path.exists());
    assert!(leased.local_path.exists());
    assert!(!victim.local_path.exists());
    assert_eq!(lease.path(), leased.local_path.as_path());
    drop(lease);

    h.cleanup();
}

#[tokio::test]
async fn test_corrupt_download_is_discarded_and_recorded() {
    let h = Harness::new(&["a"], 10).await;
    let mut item = h.catalog.put("a", "p1", &photo("p1", "v1", 4096), "v1");
    // Catalog announces more bytes than it serves.
    item.byte_size = Some(5000);

    let report = pool(&h)
        .run(CycleId::new(), vec![item], u64::MAX, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.downloaded, 0);
    let snapshot = h.cache.snapshot();
    assert!(!snapshot.contains("p1"));
    let failure = snapshot.failure("p1").unwrap();
    assert_eq!(failure.failures, 1);
    assert!(failure.last_error.contains("expected 5000 bytes"));
    assert_eq!(bytes_on_disk(&h.root), 0);
    assert_eq!(std::fs::read_dir(h.cache.store().tmp_dir()).unwrap().count(), 0);

    h.cleanup();
}

#[tokio::test]
async fn test_parallel_downloads_keep_accounting_consistent() {
    let h = Harness::new(&["a"], 100).await;
    activate(&h.cache, &["a"]).await;
    let items: Vec<_> = (0..24)
        .map(|i| {
            let id = format!("p{}", i);
            h.catalog.put("a", &id, &photo(&id, "v1", 1000 + i * 37), "v1")
        })
        .collect();
    let expected: u64 = items.iter().filter_map(|i| i.byte_size).sum();

    let report = pool(&h)
        .run(CycleId::new(), items, u64::MAX, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.downloaded, 24);
    assert_eq!(report.bytes_downloaded, expected);
    let snapshot = h.cache.snapshot();
    assert_eq!(snapshot.len(), 24);
    assert_eq!(snapshot.total_bytes(), expected);
    assert_eq!(bytes_on_disk(&h.root), expected);
    assert!(snapshot.entries().all(|e| e.pinned && e.local_path.is_absolute()));

    h.cleanup();
}

#[tokio::test]
async fn test_cancelled_pool_starts_no_downloads() {
    let h = Harness::new(&["a"], 10).await;
    let item = h.catalog.put("a", "p1", &photo("p1", "v1", 100), "v1");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pool(&h)
        .run(CycleId::new(), vec![item], u64::MAX, &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.downloaded, 0);
    assert_eq!(h.catalog.total_downloads(), 0);
    assert!(h.cache.snapshot().is_empty());

    h.cleanup();
}
