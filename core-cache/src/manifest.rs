//! Cache manifest
//!
//! Authoritative record of which remote items are available locally.
//!
//! Readers take an `Arc<ManifestSnapshot>` and never wait on writers.
//! Writers go through [`CacheManifest::commit`], which is serialized by an
//! async mutex, validates the result, persists it with write-temp-then-rename
//! and only then swaps the published snapshot.

use crate::entry::{CacheEntry, FailureRecord};
use crate::error::{CacheError, Result};
use crate::store::write_atomic;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub const MANIFEST_VERSION: u32 = 1;

/// Persisted form of the manifest.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    total_bytes: u64,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    failures: BTreeMap<String, FailureRecord>,
    #[serde(default)]
    active_albums: Vec<String>,
}

/// Immutable view of the manifest at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSnapshot {
    entries: BTreeMap<String, CacheEntry>,
    failures: BTreeMap<String, FailureRecord>,
    active_albums: Vec<String>,
    total_bytes: u64,
}

impl ManifestSnapshot {
    /// Snapshot over `entries`, with pinned flags derived from
    /// `active_albums`.
    pub fn from_entries(entries: Vec<CacheEntry>, active_albums: Vec<String>) -> Self {
        let mut snapshot = Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.remote_id.clone(), entry))
                .collect(),
            failures: BTreeMap::new(),
            active_albums,
            total_bytes: 0,
        };
        snapshot.refresh_pins();
        snapshot.total_bytes = snapshot.sum_entry_bytes();
        snapshot
    }

    pub fn get(&self, remote_id: &str) -> Option<&CacheEntry> {
        self.entries.get(remote_id)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.entries.contains_key(remote_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn pinned_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.pinned)
            .map(|e| e.byte_size)
            .sum()
    }

    pub fn active_albums(&self) -> &[String] {
        &self.active_albums
    }

    pub fn failure(&self, remote_id: &str) -> Option<&FailureRecord> {
        self.failures.get(remote_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &FailureRecord)> {
        self.failures.iter()
    }

    pub fn parked_count(&self) -> usize {
        self.failures.values().filter(|f| f.parked).count()
    }

    /// Entries of one album (or all), ordered by `fetched_at` then
    /// `remote_id`.
    pub fn entries_for_album(&self, album_id: Option<&str>) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .values()
            .filter(|e| album_id.map_or(true, |album| e.album_id == album))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.fetched_at
                .cmp(&b.fetched_at)
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });
        entries
    }

    pub fn referenced_paths(&self) -> HashSet<PathBuf> {
        self.entries.values().map(|e| e.local_path.clone()).collect()
    }

    /// Check that `total_bytes` matches the entries.
    pub fn validate(&self) -> Result<()> {
        let sum = self.sum_entry_bytes();
        if sum != self.total_bytes {
            return Err(CacheError::ManifestCorruption(format!(
                "total_bytes is {} but entries sum to {}",
                self.total_bytes, sum
            )));
        }
        for (key, entry) in &self.entries {
            if key != &entry.remote_id {
                return Err(CacheError::ManifestCorruption(format!(
                    "entry keyed {} describes {}",
                    key, entry.remote_id
                )));
            }
        }
        Ok(())
    }

    fn sum_entry_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.byte_size).sum()
    }

    fn is_active(&self, album_id: &str) -> bool {
        self.active_albums.iter().any(|a| a == album_id)
    }

    fn refresh_pins(&mut self) {
        let active: HashSet<&str> = self.active_albums.iter().map(String::as_str).collect();
        for entry in self.entries.values_mut() {
            entry.pinned = active.contains(entry.album_id.as_str());
        }
    }

    /// Apply one change. Returns whether it must be persisted.
    fn apply(&mut self, change: ManifestChange) -> bool {
        match change {
            ManifestChange::Upsert(mut entry) => {
                entry.pinned = self.is_active(&entry.album_id);
                self.entries.insert(entry.remote_id.clone(), entry);
                true
            }
            ManifestChange::Remove { remote_id } => self.entries.remove(&remote_id).is_some(),
            ManifestChange::Relabel {
                remote_id,
                album_id,
            } => {
                let pinned = self.is_active(&album_id);
                match self.entries.get_mut(&remote_id) {
                    Some(entry) => {
                        entry.album_id = album_id;
                        entry.pinned = pinned;
                        true
                    }
                    None => false,
                }
            }
            ManifestChange::SetActiveAlbums(albums) => {
                if self.active_albums == albums {
                    return false;
                }
                self.active_albums = albums;
                self.refresh_pins();
                true
            }
            ManifestChange::RecordFailure {
                remote_id,
                fingerprint,
                error,
                park_threshold,
            } => {
                let record = match self.failures.remove(&remote_id) {
                    Some(mut record) if record.matches(&fingerprint) => {
                        record.failures = record.failures.saturating_add(1);
                        record.last_error = error;
                        record
                    }
                    _ => FailureRecord::first(fingerprint, error),
                };
                let parked = park_threshold > 0 && record.failures >= park_threshold;
                self.failures.insert(
                    remote_id,
                    FailureRecord {
                        parked,
                        ..record
                    },
                );
                true
            }
            ManifestChange::ClearFailure { remote_id } => {
                self.failures.remove(&remote_id).is_some()
            }
            ManifestChange::Touch { remote_id, at } => {
                if let Some(entry) = self.entries.get_mut(&remote_id) {
                    if at > entry.last_used_at {
                        entry.last_used_at = at;
                    }
                }
                false
            }
        }
    }

    fn to_document(&self) -> ManifestDocument {
        ManifestDocument {
            version: MANIFEST_VERSION,
            total_bytes: self.total_bytes,
            entries: self.entries.clone(),
            failures: self.failures.clone(),
            active_albums: self.active_albums.clone(),
        }
    }

    fn from_document(document: ManifestDocument) -> Result<Self> {
        if document.version != MANIFEST_VERSION {
            return Err(CacheError::ManifestCorruption(format!(
                "unsupported manifest version {}",
                document.version
            )));
        }
        let mut snapshot = Self {
            entries: document.entries,
            failures: document.failures,
            active_albums: document.active_albums,
            total_bytes: document.total_bytes,
        };
        snapshot.validate()?;
        snapshot.refresh_pins();
        Ok(snapshot)
    }
}

/// One mutation of the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestChange {
    /// Insert or replace an entry whose object is already published
    Upsert(CacheEntry),
    Remove { remote_id: String },
    /// Move an entry to another album without touching its bytes
    Relabel { remote_id: String, album_id: String },
    /// Replace the active album set and recompute pinned flags
    SetActiveAlbums(Vec<String>),
    /// Count a download failure; parks the item at `park_threshold`
    RecordFailure {
        remote_id: String,
        fingerprint: String,
        error: String,
        park_threshold: u32,
    },
    ClearFailure { remote_id: String },
    /// Update `last_used_at`. Kept in memory until the next persisted commit
    /// or [`CacheManifest::flush`].
    Touch { remote_id: String, at: DateTime<Utc> },
}

/// Manifest handle shared by the sync engine and readers.
pub struct CacheManifest {
    path: PathBuf,
    current: RwLock<Arc<ManifestSnapshot>>,
    writer: Mutex<()>,
    dirty: AtomicBool,
}

impl CacheManifest {
    /// Manifest persisted at `path`, starting from `snapshot`.
    pub fn new(path: impl Into<PathBuf>, snapshot: ManifestSnapshot) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the manifest at `path`. A missing file yields an empty manifest;
    /// an unparseable or inconsistent one yields `ManifestCorruption`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No manifest on disk, starting empty");
                return Ok(Self::new(path, ManifestSnapshot::default()));
            }
            Err(e) => return Err(e.into()),
        };

        let document: ManifestDocument = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::ManifestCorruption(e.to_string()))?;
        let snapshot = ManifestSnapshot::from_document(document)?;
        debug!(entries = snapshot.len(), total_bytes = snapshot.total_bytes, "Loaded manifest");
        Ok(Self::new(path, snapshot))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<ManifestSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Apply `changes` atomically.
    ///
    /// Nothing is published if validation or persistence fails. Commits made
    /// only of `Touch` changes stay in memory.
    pub async fn commit(&self, changes: Vec<ManifestChange>) -> Result<Arc<ManifestSnapshot>> {
        let _guard = self.writer.lock().await;

        let mut next = (*self.snapshot()).clone();
        let mut persist = false;
        for change in changes {
            persist |= next.apply(change);
        }
        next.total_bytes = next.sum_entry_bytes();
        next.validate()?;

        if persist {
            self.persist(&next).await?;
            self.dirty.store(false, Ordering::SeqCst);
        } else {
            self.dirty.store(true, Ordering::SeqCst);
        }

        let next = Arc::new(next);
        *self.current.write() = Arc::clone(&next);
        Ok(next)
    }

    /// Record that `remote_id` was just displayed.
    pub async fn touch(&self, remote_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.commit(vec![ManifestChange::Touch {
            remote_id: remote_id.to_string(),
            at,
        }])
        .await
        .map(|_| ())
    }

    /// Persist in-memory-only changes, if any.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        if self.dirty.swap(false, Ordering::SeqCst) {
            let snapshot = self.snapshot();
            if let Err(e) = self.persist(&snapshot).await {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Replace the whole manifest, used by rebuild and clear.
    pub async fn replace(&self, snapshot: ManifestSnapshot) -> Result<Arc<ManifestSnapshot>> {
        let _guard = self.writer.lock().await;
        snapshot.validate()?;
        self.persist(&snapshot).await?;
        self.dirty.store(false, Ordering::SeqCst);

        let next = Arc::new(snapshot);
        *self.current.write() = Arc::clone(&next);
        Ok(next)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn persist(&self, snapshot: &ManifestSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&snapshot.to_document())?;
        write_atomic(&self.path, &bytes).await
    }
}

impl std::fmt::Debug for CacheManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CacheManifest")
            .field("path", &self.path)
            .field("entries", &snapshot.len())
            .field("total_bytes", &snapshot.total_bytes)
            .finish()
    }
}
