//! # Sync Planner
//!
//! Diffs the remote listing against the manifest.
//!
//! Items are keyed by `remote_id` over the union of all active album
//! listings. An item listed in several albums belongs to the first one in
//! active-album order.
//!
//! - new, or changed remotely → `to_fetch`
//! - same content under a different album → `to_relabel`
//! - cached but no longer listed → `to_remove`. Entries of deselected
//!   albums always qualify. Entries of active albums only qualify when every
//!   active album was listed completely, since the item may have moved to a
//!   page that was never read.
//! - everything else is unchanged
//!
//! Change detection prefers the content hash, then the etag, then the
//! modification time. A known size mismatch always means re-fetch.

use bridge_traits::catalog::RemoteItem;
use core_cache::{CacheEntry, ManifestSnapshot};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Union of album listings gathered during one cycle.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    items: BTreeMap<String, RemoteItem>,
    complete_albums: HashSet<String>,
    listed_albums: Vec<String>,
}

impl RemoteSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one album's listing. Albums must be added in active-album order;
    /// an item already seen under an earlier album keeps that album.
    pub fn add_album(&mut self, album_id: &str, items: Vec<RemoteItem>, complete: bool) {
        for mut item in items {
            if self.items.contains_key(&item.remote_id) {
                continue;
            }
            item.album_id = album_id.to_string();
            self.items.insert(item.remote_id.clone(), item);
        }
        if complete {
            self.complete_albums.insert(album_id.to_string());
        }
        self.listed_albums.push(album_id.to_string());
    }

    pub fn get(&self, remote_id: &str) -> Option<&RemoteItem> {
        self.items.get(remote_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_complete(&self, album_id: &str) -> bool {
        self.complete_albums.contains(album_id)
    }

    /// Every listed album was listed to the end.
    pub fn all_complete(&self) -> bool {
        self.listed_albums
            .iter()
            .all(|album| self.complete_albums.contains(album))
    }
}

/// Work computed for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_fetch: Vec<RemoteItem>,
    pub to_remove: Vec<String>,
    /// `(remote_id, new album_id)`
    pub to_relabel: Vec<(String, String)>,
    /// Failure records of items no longer listed anywhere
    pub stale_failures: Vec<String>,
    pub unchanged_count: u64,
    pub parked_count: u64,
}

pub struct SyncPlanner;

impl SyncPlanner {
    pub fn plan(remote: &RemoteSnapshot, manifest: &ManifestSnapshot) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let active: HashSet<&str> = manifest.active_albums().iter().map(String::as_str).collect();
        let active_complete = active.iter().all(|album| remote.is_complete(album));

        for item in remote.items.values() {
            let cached = manifest.get(&item.remote_id);
            let changed = cached.map_or(true, |entry| needs_fetch(item, entry));

            if changed {
                let parked = manifest
                    .failure(&item.remote_id)
                    .map_or(false, |f| f.parked && f.matches(&item.fingerprint()));
                if parked {
                    debug!(remote_id = %item.remote_id, "Item parked, not fetching");
                    plan.parked_count += 1;
                } else {
                    plan.to_fetch.push(item.clone());
                }
                continue;
            }

            match cached {
                Some(entry) if entry.album_id != item.album_id => {
                    plan.to_relabel
                        .push((item.remote_id.clone(), item.album_id.clone()));
                }
                _ => plan.unchanged_count += 1,
            }
        }

        for entry in manifest.entries() {
            if remote.get(&entry.remote_id).is_some() {
                continue;
            }
            if !active.contains(entry.album_id.as_str()) || active_complete {
                plan.to_remove.push(entry.remote_id.clone());
            }
        }

        if remote.all_complete() {
            plan.stale_failures = manifest
                .failures()
                .filter(|(remote_id, _)| remote.get(remote_id).is_none())
                .map(|(remote_id, _)| remote_id.clone())
                .collect();
        }

        debug!(
            to_fetch = plan.to_fetch.len(),
            to_remove = plan.to_remove.len(),
            to_relabel = plan.to_relabel.len(),
            unchanged = plan.unchanged_count,
            parked = plan.parked_count,
            "Sync plan computed"
        );
        plan
    }
}

/// Whether the cached copy of `item` is out of date.
fn needs_fetch(item: &RemoteItem, entry: &CacheEntry) -> bool {
    if let Some(size) = item.byte_size {
        if size != entry.byte_size {
            return true;
        }
    }

    if let Some(hash) = &item.content_hash {
        return !hash.eq_ignore_ascii_case(&entry.content_hash);
    }

    if item.etag.is_some() {
        return item.fingerprint() != entry.remote_version;
    }

    item.modified_at != entry.remote_modified_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use core_cache::{FailureRecord, ManifestChange};
    use std::path::PathBuf;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 10, minute, 0).unwrap()
    }

    fn item(remote_id: &str, album_id: &str) -> RemoteItem {
        RemoteItem {
            remote_id: remote_id.to_string(),
            album_id: album_id.to_string(),
            content_hash: None,
            etag: None,
            byte_size: None,
            modified_at: at(0),
            download_url: format!("https://photos.example/{}", remote_id),
            filename: None,
            mime_type: None,
            details: Default::default(),
        }
    }

    fn entry_for(item: &RemoteItem, size: u64, content_hash: &str) -> CacheEntry {
        CacheEntry {
            remote_id: item.remote_id.clone(),
            album_id: item.album_id.clone(),
            local_path: PathBuf::from(format!("/cache/objects/00/{}.jpg", item.remote_id)),
            byte_size: size,
            content_hash: content_hash.to_string(),
            remote_version: item.fingerprint(),
            remote_modified_at: item.modified_at,
            fetched_at: at(1),
            last_used_at: at(1),
            pinned: true,
            filename: None,
            mime_type: None,
            details: Default::default(),
        }
    }

    fn manifest(entries: Vec<CacheEntry>, albums: &[&str]) -> ManifestSnapshot {
        ManifestSnapshot::from_entries(entries, albums.iter().map(|a| a.to_string()).collect())
    }

    fn snapshot(albums: Vec<(&str, Vec<RemoteItem>, bool)>) -> RemoteSnapshot {
        let mut remote = RemoteSnapshot::new();
        for (album, items, complete) in albums {
            remote.add_album(album, items, complete);
        }
        remote
    }

    #[test]
    fn test_new_and_unchanged_items() {
        let cached: Vec<RemoteItem> = (0..8).map(|i| item(&format!("p{}", i), "a")).collect();
        let entries = cached.iter().map(|i| entry_for(i, 10, "h")).collect();
        let mut listing = cached.clone();
        listing.push(item("new1", "a"));
        listing.push(item("new2", "a"));

        let plan = SyncPlanner::plan(
            &snapshot(vec![("a", listing, true)]),
            &manifest(entries, &["a"]),
        );

        let ids: Vec<&str> = plan.to_fetch.iter().map(|i| i.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["new1", "new2"]);
        assert_eq!(plan.unchanged_count, 8);
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn test_change_detection_order() {
        // content hash wins over etag and timestamps
        let mut hashed = item("h", "a");
        hashed.content_hash = Some("AA11".into());
        hashed.etag = Some("e1".into());
        let entry = entry_for(&hashed, 10, "aa11");
        let mut moved_time = hashed.clone();
        moved_time.modified_at = at(30);
        moved_time.etag = Some("e2".into());
        assert!(!needs_fetch(&moved_time, &entry));
        let mut new_hash = hashed.clone();
        new_hash.content_hash = Some("bb22".into());
        assert!(needs_fetch(&new_hash, &entry));

        // etag when no hash
        let mut tagged = item("t", "a");
        tagged.etag = Some("v1".into());
        let entry = entry_for(&tagged, 10, "x");
        assert!(!needs_fetch(&tagged, &entry));
        let mut retagged = tagged.clone();
        retagged.etag = Some("v2".into());
        assert!(needs_fetch(&retagged, &entry));

        // timestamp as last resort, even with an unchanged size
        let mut plain = item("m", "a");
        plain.byte_size = Some(10);
        let entry = entry_for(&plain, 10, "x");
        assert!(!needs_fetch(&plain, &entry));
        let mut touched = plain.clone();
        touched.modified_at = at(5);
        assert!(needs_fetch(&touched, &entry));

        // size mismatch always refetches
        let mut resized = tagged.clone();
        resized.byte_size = Some(11);
        assert!(needs_fetch(&resized, &entry_for(&tagged, 10, "x")));
    }

    #[test]
    fn test_moved_item_is_relabeled() {
        let original = item("p1", "a");
        let entries = vec![entry_for(&original, 10, "h")];

        let plan = SyncPlanner::plan(
            &snapshot(vec![("a", vec![], true), ("b", vec![item("p1", "b")], true)]),
            &manifest(entries, &["a", "b"]),
        );

        assert_eq!(plan.to_relabel, vec![("p1".to_string(), "b".to_string())]);
        assert!(plan.to_fetch.is_empty());
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn test_first_active_album_wins() {
        let plan = SyncPlanner::plan(
            &snapshot(vec![
                ("a", vec![item("p1", "a")], true),
                ("b", vec![item("p1", "b")], true),
            ]),
            &manifest(vec![], &["a", "b"]),
        );
        assert_eq!(plan.to_fetch.len(), 1);
        assert_eq!(plan.to_fetch[0].album_id, "a");
    }

    #[test]
    fn test_removals_respect_incomplete_listings() {
        let in_a = item("gone-a", "a");
        let in_b = item("gone-b", "b");
        let in_old = item("gone-old", "old");
        let entries = vec![
            entry_for(&in_a, 1, "h"),
            entry_for(&in_b, 1, "h"),
            entry_for(&in_old, 1, "h"),
        ];

        let cached = manifest(entries, &["a", "b"]);

        let plan = SyncPlanner::plan(
            &snapshot(vec![("a", vec![], true), ("b", vec![], false)]),
            &cached,
        );
        assert_eq!(plan.to_remove, vec!["gone-old".to_string()]);

        let plan = SyncPlanner::plan(
            &snapshot(vec![("a", vec![], true), ("b", vec![], true)]),
            &cached,
        );
        let mut removed = plan.to_remove.clone();
        removed.sort();
        assert_eq!(removed, vec!["gone-a", "gone-b", "gone-old"]);
    }

    #[test]
    fn test_item_moved_onto_unlisted_page_is_kept() {
        let moved = item("moved", "a");
        let entries = vec![entry_for(&moved, 10, "h")];

        // `a` no longer holds it; `b` failed before reaching its page.
        let plan = SyncPlanner::plan(
            &snapshot(vec![("a", vec![], true), ("b", vec![item("other", "b")], false)]),
            &manifest(entries, &["a", "b"]),
        );

        assert!(plan.to_remove.is_empty());
        assert!(plan.to_relabel.is_empty());
        assert_eq!(plan.to_fetch.len(), 1);
    }

    #[test]
    fn test_unlisted_active_album_blocks_removal() {
        let gone = item("gone", "a");
        let plan = SyncPlanner::plan(
            &snapshot(vec![("a", vec![], true)]),
            &manifest(vec![entry_for(&gone, 10, "h")], &["a", "b"]),
        );
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn test_parked_items_skip_until_changed() {
        let mut broken = item("bad", "a");
        broken.etag = Some("v1".into());
        let mut base = manifest(vec![], &["a"]);
        base = apply_failure(base, &broken, 3);

        let plan = SyncPlanner::plan(&snapshot(vec![("a", vec![broken.clone()], true)]), &base);
        assert!(plan.to_fetch.is_empty());
        assert_eq!(plan.parked_count, 1);

        let mut fixed = broken.clone();
        fixed.etag = Some("v2".into());
        let plan = SyncPlanner::plan(&snapshot(vec![("a", vec![fixed], true)]), &base);
        assert_eq!(plan.to_fetch.len(), 1);
        assert_eq!(plan.parked_count, 0);

        let plan = SyncPlanner::plan(&snapshot(vec![("a", vec![], true)]), &base);
        assert_eq!(plan.stale_failures, vec!["bad".to_string()]);
        let plan = SyncPlanner::plan(&snapshot(vec![("a", vec![], false)]), &base);
        assert!(plan.stale_failures.is_empty());
    }

    /// Park `item` by recording `count` failures through a throwaway manifest.
    fn apply_failure(base: ManifestSnapshot, item: &RemoteItem, count: u32) -> ManifestSnapshot {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let path = std::env::temp_dir()
            .join(format!("core-sync-planner-{}", uuid::Uuid::new_v4()))
            .join("manifest.json");
        let manifest = core_cache::CacheManifest::new(&path, base);
        runtime.block_on(async {
            for _ in 0..count {
                manifest
                    .commit(vec![ManifestChange::RecordFailure {
                        remote_id: item.remote_id.clone(),
                        fingerprint: item.fingerprint(),
                        error: "HTTP 500".into(),
                        park_threshold: 3,
                    }])
                    .await
                    .unwrap();
            }
        });
        let snapshot = (*manifest.snapshot()).clone();
        assert_eq!(
            snapshot.failure(&item.remote_id),
            Some(&FailureRecord {
                failures: count,
                fingerprint: item.fingerprint(),
                last_error: "HTTP 500".into(),
                parked: true,
            })
        );
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
        snapshot
    }
}
