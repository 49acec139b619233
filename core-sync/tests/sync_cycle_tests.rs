//! Integration tests for full sync cycles
//!
//! These tests run the engine against an in-memory catalog and a real cache
//! directory:
//! - Fetching only new items and leaving unchanged ones alone
//! - Idempotent re-runs and byte accounting against the disk
//! - Quota enforcement when pinned items fill the cache
//! - Token expiry in the middle of a paged listing
//! - Crash recovery through startup reconciliation
//! - Removal, relabeling, parking and incomplete listings

mod common;

use chrono::Duration;
use common::*;
use core_cache::{CacheEntry, ManifestChange};
use core_runtime::config::SyncTuning;
use core_runtime::events::{CacheEvent, CoreEvent, SyncEvent};
use core_sync::{SchedulerState, SyncError, SyncScheduler, TriggerOutcome};
use std::sync::Arc;

fn seed_album(harness: &Harness, album_id: &str, count: usize, size: usize) {
    for i in 0..count {
        let id = format!("{}-{}", album_id, i);
        harness
            .catalog
            .put(album_id, &id, &photo(&id, "v1", size), "v1");
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_fetches_only_new_items_and_leaves_cached_ones_untouched() {
    let h = Harness::new(&["family"], 100).await;
    seed_album(&h, "family", 8, 512);
    let first = h.cycle().await.unwrap();
    assert_eq!(first.stats.downloaded, 8);

    let before: Vec<CacheEntry> = h.cache.snapshot().entries().cloned().collect();
    h.clock.advance(Duration::hours(1));
    h.catalog.put("family", "new-1", &photo("new-1", "v1", 700), "v1");
    h.catalog.put("family", "new-2", &photo("new-2", "v1", 900), "v1");

    let second = h.cycle().await.unwrap();

    assert_eq!(second.stats.listed, 10);
    assert_eq!(second.stats.downloaded, 2);
    assert_eq!(second.stats.unchanged, 8);
    assert_eq!(h.catalog.total_downloads(), 10);
    assert_eq!(h.catalog.download_count("new-1"), 1);
    assert_eq!(h.catalog.download_count("new-2"), 1);
    for entry in &before {
        assert_eq!(h.entry(&entry.remote_id).as_ref(), Some(entry));
    }

    h.cleanup();
}

#[tokio::test]
async fn test_second_cycle_without_remote_changes_is_a_noop() {
    let h = Harness::new(&["a", "b"], 3).await;
    seed_album(&h, "a", 5, 256);
    seed_album(&h, "b", 4, 300);

    h.cycle().await.unwrap();
    let downloads = h.catalog.total_downloads();
    let snapshot = h.cache.snapshot();

    let again = h.cycle().await.unwrap();

    assert_eq!(again.stats.downloaded, 0);
    assert_eq!(again.stats.evicted, 0);
    assert_eq!(again.stats.removed, 0);
    assert_eq!(again.stats.relabeled, 0);
    assert_eq!(h.catalog.total_downloads(), downloads);
    assert_eq!(*h.cache.snapshot(), *snapshot);

    h.cleanup();
}

#[tokio::test]
async fn test_total_bytes_matches_disk_across_cycles() {
    let h = Harness::new(&["a"], 4).await;
    seed_album(&h, "a", 6, 1000);
    h.cycle().await.unwrap();
    assert_eq!(h.cache.snapshot().total_bytes(), bytes_on_disk(&h.root));

    // Change one photo, delete another, add a third.
    h.catalog.put("a", "a-0", &photo("a-0", "v2", 1500), "v2");
    h.catalog.remove("a", "a-1");
    h.catalog.put("a", "a-9", &photo("a-9", "v1", 333), "v1");
    h.clock.advance(Duration::minutes(5));
    let report = h.cycle().await.unwrap();

    assert_eq!(report.stats.downloaded, 2);
    assert_eq!(report.stats.removed, 1);
    let snapshot = h.cache.snapshot();
    assert_eq!(snapshot.len(), 6);
    assert_eq!(snapshot.get("a-0").unwrap().byte_size, 1500);
    assert_eq!(snapshot.total_bytes(), bytes_on_disk(&h.root));
    assert_eq!(snapshot.total_bytes(), 1500 + 4 * 1000 + 333);

    h.cleanup();
}

#[tokio::test]
async fn test_pinned_items_beyond_quota_are_rejected_and_reported() {
    let h = Harness::new(&["a"], 10).await;
    h.settings.set(settings(&["a"], gb(120)));
    seed_album(&h, "a", 3, 50);
    let mut events = h.bus.subscribe();

    let report = h.cycle().await.unwrap();

    assert_eq!(report.stats.downloaded, 2);
    assert_eq!(report.stats.rejected, 1);
    assert!(report.quota_shortfall.is_some());
    assert!(report.warning().unwrap().contains("quota"));
    let snapshot = h.cache.snapshot();
    assert_eq!(snapshot.total_bytes(), 100);
    assert_eq!(bytes_on_disk(&h.root), 100);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        CoreEvent::Cache(CacheEvent::QuotaUnenforceable { .. })
    )));

    h.cleanup();
}

#[tokio::test]
async fn test_token_expiry_mid_listing_resumes_from_same_page() {
    let h = Harness::new(&["trip"], 2).await;
    seed_album(&h, "trip", 10, 128);
    h.catalog.expire_token_once_at("trip", 2);

    let report = h.cycle().await.unwrap();

    assert_eq!(h.tokens.refresh_count(), 1);
    let tokens: Vec<Option<String>> = h
        .catalog
        .page_requests
        .lock()
        .iter()
        .map(|(_, token)| token.clone())
        .collect();
    let expected: Vec<Option<String>> = vec![None, Some("2"), Some("4"), Some("4"), Some("6"), Some("8")]
        .into_iter()
        .map(|t| t.map(str::to_string))
        .collect();
    assert_eq!(tokens, expected);

    assert_eq!(report.stats.downloaded, 10);
    assert_eq!(h.catalog.total_downloads(), 10);
    for i in 0..10 {
        assert_eq!(h.catalog.download_count(&format!("trip-{}", i)), 1);
    }

    h.cleanup();
}

#[tokio::test]
async fn test_revoked_credential_fails_cycle_and_halts_scheduler() {
    let h = Harness::new(&["a"], 10).await;
    seed_album(&h, "a", 2, 64);
    h.cycle().await.unwrap();

    h.tokens.revoke();
    let mut events = h.bus.subscribe();
    let err = h.cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthRequired(_)));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        CoreEvent::Sync(SyncEvent::Failed { recoverable: false, .. })
    )));
    // Committed work survives.
    assert_eq!(h.cache.snapshot().len(), 2);

    let Harness { engine, clock, root, .. } = h;
    let scheduler = SyncScheduler::new(Arc::new(engine), clock);
    assert_eq!(scheduler.trigger(), TriggerOutcome::Accepted);
    scheduler.wait_idle().await;
    assert_eq!(scheduler.state(), SchedulerState::AuthRequired);
    assert_eq!(scheduler.trigger(), TriggerOutcome::AuthRequired);

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn test_catalog_rejecting_credential_mid_listing_requires_authorization() {
    let h = Harness::new(&["a"], 10).await;
    seed_album(&h, "a", 2, 64);
    h.catalog.revoke();

    let err = h.cycle().await.unwrap_err();

    assert!(err.requires_reauthorization());
    assert_eq!(h.catalog.total_downloads(), 0);

    h.cleanup();
}

#[tokio::test]
async fn test_restart_after_crash_reconciles_before_sync() {
    let h = Harness::new(&["a"], 10).await;
    seed_album(&h, "a", 3, 400);
    h.cycle().await.unwrap();

    // A download published but never committed.
    let store = h.cache.store().clone();
    let mut staging = store.stage().await.unwrap();
    staging.write_chunk(b"orphaned bytes").await.unwrap();
    let staged = staging.finish().await.unwrap();
    let orphan = CacheEntry {
        local_path: store.object_path_for("ghost", staged.content_hash(), "jpg"),
        remote_id: "ghost".to_string(),
        byte_size: staged.byte_size(),
        content_hash: staged.content_hash().to_string(),
        ..h.entry("a-0").unwrap()
    };
    store.publish(staged, &orphan).await.unwrap();

    // An interrupted download and a file lost underneath the manifest.
    std::fs::write(store.tmp_dir().join("interrupted.part"), b"half").unwrap();
    let lost = h.entry("a-1").unwrap();
    std::fs::remove_file(&lost.local_path).unwrap();

    let h = h.restart().await;

    assert!(!orphan.local_path.exists());
    assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    let snapshot = h.cache.snapshot();
    assert!(!snapshot.contains("ghost"));
    assert!(!snapshot.contains("a-1"));
    for entry in snapshot.entries() {
        let len = std::fs::metadata(&entry.local_path).unwrap().len();
        assert_eq!(len, entry.byte_size);
    }
    assert_eq!(snapshot.total_bytes(), bytes_on_disk(&h.root));

    let report = h.cycle().await.unwrap();
    assert_eq!(report.stats.downloaded, 1);
    assert!(h.entry("a-1").unwrap().local_path.exists());
    assert_eq!(h.catalog.download_count("a-1"), 2);

    h.cleanup();
}

#[tokio::test]
async fn test_moved_item_is_relabeled_without_download() {
    let h = Harness::new(&["a", "b"], 10).await;
    let bytes = photo("p1", "v1", 2048);
    h.catalog.put("a", "p1", &bytes, "v1");
    h.cycle().await.unwrap();

    h.catalog.remove("a", "p1");
    h.catalog.put("b", "p1", &bytes, "v1");
    let report = h.cycle().await.unwrap();

    assert_eq!(report.stats.relabeled, 1);
    assert_eq!(report.stats.downloaded, 0);
    assert_eq!(report.stats.removed, 0);
    assert_eq!(h.catalog.download_count("p1"), 1);
    assert_eq!(h.entry("p1").unwrap().album_id, "b");

    h.cleanup();
}

#[tokio::test]
async fn test_deselected_album_items_are_removed() {
    let h = Harness::new(&["a", "b"], 10).await;
    seed_album(&h, "a", 2, 100);
    seed_album(&h, "b", 2, 100);
    h.cycle().await.unwrap();
    let dropped = h.entry("b-0").unwrap();

    h.settings.set(settings(&["a"], 1.0));
    let report = h.cycle().await.unwrap();

    assert_eq!(report.stats.removed, 2);
    assert!(!dropped.local_path.exists());
    let snapshot = h.cache.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.active_albums(), ["a".to_string()]);
    assert!(snapshot.entries().all(|e| e.pinned));

    h.cleanup();
}

#[tokio::test]
async fn test_incomplete_listing_never_removes() {
    let h = Harness::new(&["a"], 2).await;
    seed_album(&h, "a", 6, 100);
    h.cycle().await.unwrap();

    h.catalog.remove("a", "a-0");
    h.catalog.fail_listing_from("a", 1);
    let report = h.cycle().await.unwrap();

    assert_eq!(report.stats.removed, 0);
    assert_eq!(report.listing_errors.len(), 1);
    assert!(report.warning().unwrap().contains("album a"));
    assert!(h.entry("a-0").is_some());

    h.catalog.restore_listing();
    let report = h.cycle().await.unwrap();
    assert_eq!(report.stats.removed, 1);
    assert!(h.entry("a-0").is_none());

    h.cleanup();
}

#[tokio::test]
async fn test_item_moved_into_partially_listed_album_is_kept() {
    let h = Harness::new(&["a", "b"], 2).await;
    seed_album(&h, "a", 1, 100);
    seed_album(&h, "b", 4, 100);
    h.cycle().await.unwrap();
    let cached = h.entry("a-0").unwrap();

    // a-0 moves to the third page of b, which cannot be listed this time.
    h.catalog.remove("a", "a-0");
    h.catalog.put("b", "a-0", &photo("a-0", "v1", 100), "v1");
    h.catalog.fail_listing_from("b", 2);
    let report = h.cycle().await.unwrap();

    assert_eq!(report.stats.removed, 0);
    assert_eq!(h.entry("a-0"), Some(cached.clone()));
    assert!(cached.local_path.exists());

    h.catalog.restore_listing();
    let report = h.cycle().await.unwrap();
    assert_eq!(report.stats.removed, 0);
    assert_eq!(report.stats.relabeled, 1);
    assert_eq!(h.entry("a-0").unwrap().album_id, "b");
    assert_eq!(h.catalog.download_count("a-0"), 1);

    h.cleanup();
}

#[tokio::test]
async fn test_repeatedly_failing_item_is_parked_until_it_changes() {
    let h = Harness::new(&["a"], 10).await;
    h.catalog.put("a", "good", &photo("good", "v1", 100), "v1");
    h.catalog.put("a", "bad", &photo("bad", "v1", 100), "v1");
    h.catalog.break_asset("bad");
    let mut events = h.bus.subscribe();

    for _ in 0..3 {
        let report = h.cycle().await.unwrap();
        assert_eq!(report.stats.failed, 1);
    }
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        CoreEvent::Cache(CacheEvent::ItemParked { remote_id, failures: 3 }) if remote_id == "bad"
    )));
    assert!(h.cache.snapshot().failure("bad").unwrap().parked);

    let report = h.cycle().await.unwrap();
    assert_eq!(report.stats.parked_skipped, 1);
    assert_eq!(h.catalog.download_count("bad"), 3);

    // A new version unparks it.
    h.catalog.put("a", "bad", &photo("bad", "v2", 120), "v2");
    let report = h.cycle().await.unwrap();
    assert_eq!(report.stats.failed, 1);
    assert_eq!(h.catalog.download_count("bad"), 4);
    assert_eq!(h.cache.snapshot().failure("bad").unwrap().failures, 1);

    h.cleanup();
}

#[tokio::test]
async fn test_no_selected_albums_skips_cycle() {
    let h = Harness::new(&[], 10).await;

    let report = h.cycle().await.unwrap();

    assert_eq!(report.skipped_reason.as_deref(), Some("no albums selected"));
    assert!(h.catalog.page_requests.lock().is_empty());

    h.cleanup();
}

#[tokio::test]
async fn test_cancelled_cycle_leaves_manifest_consistent() {
    let h = Harness::new(&["a"], 10).await;
    seed_album(&h, "a", 4, 100);
    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();

    let err = core_sync::CycleRunner::run_cycle(&h.engine, cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    let snapshot = h.cache.snapshot();
    assert_eq!(snapshot.total_bytes(), bytes_on_disk(&h.root));
    assert_eq!(std::fs::read_dir(h.cache.store().tmp_dir()).unwrap().count(), 0);

    // Still usable afterwards.
    h.cache
        .manifest()
        .commit(vec![ManifestChange::SetActiveAlbums(vec!["a".into()])])
        .await
        .unwrap();
    assert_eq!(h.cycle().await.unwrap().stats.downloaded, 4);

    h.cleanup();
}

#[tokio::test(start_paused = true)]
async fn test_slow_catalog_calls_are_not_cut_short() {
    let h = Harness::new(&["family"], 2).await;
    seed_album(&h, "family", 5, 256);
    // Longer than one request timeout, as when the catalog waits out rate limits.
    let tuning = SyncTuning::default();
    h.catalog
        .slow_responses(tuning.listing_timeout.max(tuning.download_timeout) * 3);

    let report = h.cycle().await.unwrap();

    assert!(report.listing_errors.is_empty(), "{:?}", report.listing_errors);
    assert_eq!(report.stats.listed, 5);
    assert_eq!(report.stats.downloaded, 5);
    assert_eq!(report.stats.failed, 0);

    h.cleanup();
}

#[tokio::test]
async fn test_photo_details_are_cached_with_the_entry() {
    let h = Harness::new(&["family"], 10).await;
    seed_album(&h, "family", 2, 128);

    h.cycle().await.unwrap();

    let entry = h.entry("family-1").unwrap();
    assert_eq!(entry.details.description.as_deref(), Some("Photo family-1"));

    // Rebuilt from sidecars after the manifest is corrupted.
    std::fs::write(h.root.join("manifest.json"), b"{ not json").unwrap();
    let h = h.restart().await;
    assert_eq!(
        h.entry("family-1").unwrap().details.description.as_deref(),
        Some("Photo family-1")
    );

    h.cleanup();
}
