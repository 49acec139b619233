//! Startup reconciliation, manifest rebuild and orphan sweeping
//!
//! The manifest and the content store can disagree after a crash or an
//! external deletion. These routines bring them back in line:
//!
//! - [`reconcile`] runs at startup before the manifest is served.
//! - [`rebuild_from_sidecars`] replaces a corrupted manifest.
//! - [`sweep_orphans`] runs at the end of every sync cycle.

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::manifest::{CacheManifest, ManifestChange, ManifestSnapshot};
use crate::store::{hash_file, ContentStore};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub temp_files_removed: u64,
    pub orphans_removed: u64,
    pub entries_dropped: u64,
}

/// Align the manifest with the store.
///
/// Deletes temp files, drops entries whose object is missing or has the
/// wrong size, then deletes objects and sidecars no entry references.
#[instrument(skip_all)]
pub async fn reconcile(manifest: &CacheManifest, store: &ContentStore) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        temp_files_removed: store.clear_tmp().await?,
        ..Default::default()
    };

    let snapshot = manifest.snapshot();
    let mut dropped = Vec::new();
    for entry in snapshot.entries() {
        if let Some(reason) = check_object(entry).await? {
            warn!(remote_id = %entry.remote_id, reason, "Dropping cache entry");
            dropped.push(ManifestChange::Remove {
                remote_id: entry.remote_id.clone(),
            });
        }
    }
    report.entries_dropped = dropped.len() as u64;
    if !dropped.is_empty() {
        manifest.commit(dropped).await?;
    }

    let referenced = manifest.snapshot().referenced_paths();
    report.orphans_removed = remove_unreferenced(store, &referenced, &HashSet::new()).await?;

    info!(
        temp_files_removed = report.temp_files_removed,
        orphans_removed = report.orphans_removed,
        entries_dropped = report.entries_dropped,
        "Cache reconciled"
    );
    Ok(report)
}

/// Delete objects no entry references, leaving leased paths alone.
/// Returns how many objects were removed.
#[instrument(skip_all)]
pub async fn sweep_orphans(
    manifest: &CacheManifest,
    store: &ContentStore,
    leased: &HashSet<PathBuf>,
) -> Result<u64> {
    let referenced = manifest.snapshot().referenced_paths();
    let removed = remove_unreferenced(store, &referenced, leased).await?;
    if removed > 0 {
        info!(removed, "Swept orphaned objects");
    }
    Ok(removed)
}

/// Reconstruct manifest entries from sidecar records.
///
/// Every object is re-hashed and re-sized; objects that do not match their
/// sidecar, or have none, are deleted. When two objects claim the same
/// remote item the most recently fetched one wins. Failure history is lost.
#[instrument(skip_all)]
pub async fn rebuild_from_sidecars(
    store: &ContentStore,
    active_albums: Vec<String>,
) -> Result<ManifestSnapshot> {
    let scan = store.scan().await?;
    let mut survivors: HashMap<String, CacheEntry> = HashMap::new();
    let mut discarded = 0u64;

    for object in &scan.objects {
        let entry = match rebuild_entry(store, object).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                store.delete_object(object).await?;
                discarded += 1;
                continue;
            }
            Err(e) => {
                warn!(path = %object.display(), error = %e, "Unreadable object, discarding");
                store.delete_object(object).await?;
                discarded += 1;
                continue;
            }
        };

        let loser = match survivors.remove(&entry.remote_id) {
            Some(existing) if existing.fetched_at >= entry.fetched_at => {
                survivors.insert(existing.remote_id.clone(), existing);
                entry
            }
            Some(existing) => {
                survivors.insert(entry.remote_id.clone(), entry);
                existing
            }
            None => {
                survivors.insert(entry.remote_id.clone(), entry);
                continue;
            }
        };
        store.delete_object(&loser.local_path).await?;
        discarded += 1;
    }

    for sidecar in &scan.sidecars {
        if let Some(object) = ContentStore::object_for_sidecar(sidecar) {
            if !exists(&object).await? {
                store.delete_object(&object).await?;
            }
        }
    }

    info!(
        recovered = survivors.len(),
        discarded,
        "Rebuilt manifest from sidecars"
    );
    Ok(ManifestSnapshot::from_entries(
        survivors.into_values().collect(),
        active_albums,
    ))
}

async fn rebuild_entry(store: &ContentStore, object: &Path) -> Result<Option<CacheEntry>> {
    let record = match store.read_sidecar(object).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(path = %object.display(), "Object has no sidecar");
            return Ok(None);
        }
        Err(e) => {
            debug!(path = %object.display(), error = %e, "Sidecar unreadable");
            return Ok(None);
        }
    };

    let (hash, size) = hash_file(object).await?;
    if hash != record.content_hash || size != record.byte_size {
        warn!(
            remote_id = %record.remote_id,
            expected_size = record.byte_size,
            actual_size = size,
            "Object does not match its sidecar"
        );
        return Ok(None);
    }

    Ok(Some(record.into_entry(object.to_path_buf())))
}

/// Why the object behind `entry` is unusable, if it is.
async fn check_object(entry: &CacheEntry) -> Result<Option<&'static str>> {
    match tokio::fs::metadata(&entry.local_path).await {
        Ok(metadata) if !metadata.is_file() => Ok(Some("not a regular file")),
        Ok(metadata) if metadata.len() != entry.byte_size => Ok(Some("size mismatch")),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Some("file missing")),
        Err(e) => Err(e.into()),
    }
}

async fn remove_unreferenced(
    store: &ContentStore,
    referenced: &HashSet<PathBuf>,
    leased: &HashSet<PathBuf>,
) -> Result<u64> {
    let scan = store.scan().await?;
    let mut removed = 0;

    for object in &scan.objects {
        if referenced.contains(object) || leased.contains(object) {
            continue;
        }
        match store.delete_object(object).await {
            Ok(()) => {
                debug!(path = %object.display(), "Removed orphaned object");
                removed += 1;
            }
            Err(e) => warn!(path = %object.display(), error = %e, "Failed to remove orphan"),
        }
    }

    for sidecar in &scan.sidecars {
        let Some(object) = ContentStore::object_for_sidecar(sidecar) else {
            continue;
        };
        if referenced.contains(&object) || leased.contains(&object) {
            continue;
        }
        if let Err(e) = tokio::fs::remove_file(sidecar).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %sidecar.display(), error = %e, "Failed to remove orphaned sidecar");
            }
        }
    }

    Ok(removed)
}

async fn exists(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
