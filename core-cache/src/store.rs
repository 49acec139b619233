//! Content-addressed object store
//!
//! Layout under the cache root:
//!
//! ```text
//! manifest.json
//! tmp/<uuid>.part
//! objects/<hh>/<key>.<ext>
//! objects/<hh>/<key>.<ext>.meta.json
//! ```
//!
//! `key` is `hex(sha256(remote_id))-<first 16 hex chars of the content hash>`
//! and `hh` its first two characters. Objects only appear under `objects/`
//! through a rename from `tmp/`, after their bytes were fsynced and their
//! sidecar record written.

use crate::entry::CacheEntry;
use bridge_traits::catalog::PhotoDetails;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIDECAR_SUFFIX: &str = ".meta.json";
const TMP_DIR: &str = "tmp";
const OBJECTS_DIR: &str = "objects";
const PART_EXTENSION: &str = "part";
const DETACHED_EXTENSION: &str = "evict";
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Durable description of a published object, stored next to it.
///
/// Sidecars are what a corrupted manifest is rebuilt from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub remote_id: String,
    pub album_id: String,
    pub byte_size: u64,
    pub content_hash: String,
    pub remote_version: String,
    pub remote_modified_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "PhotoDetails::is_empty")]
    pub details: PhotoDetails,
}

impl SidecarRecord {
    /// Entry for the object at `local_path`. `pinned` is left for the
    /// manifest to derive.
    pub fn into_entry(self, local_path: PathBuf) -> CacheEntry {
        CacheEntry {
            remote_id: self.remote_id,
            album_id: self.album_id,
            local_path,
            byte_size: self.byte_size,
            content_hash: self.content_hash,
            remote_version: self.remote_version,
            remote_modified_at: self.remote_modified_at,
            fetched_at: self.fetched_at,
            last_used_at: self.fetched_at,
            pinned: false,
            filename: self.filename,
            mime_type: self.mime_type,
            details: self.details,
        }
    }
}

impl From<&CacheEntry> for SidecarRecord {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            remote_id: entry.remote_id.clone(),
            album_id: entry.album_id.clone(),
            byte_size: entry.byte_size,
            content_hash: entry.content_hash.clone(),
            remote_version: entry.remote_version.clone(),
            remote_modified_at: entry.remote_modified_at,
            fetched_at: entry.fetched_at,
            filename: entry.filename.clone(),
            mime_type: entry.mime_type.clone(),
            details: entry.details.clone(),
        }
    }
}

/// Files found under `objects/`.
#[derive(Debug, Default)]
pub struct ObjectScan {
    pub objects: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
}

/// On-disk content store rooted at the cache directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    /// Create `tmp/` and `objects/` if missing.
    pub async fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.tmp_dir()).await?;
        fs::create_dir_all(self.objects_dir()).await?;
        Ok(())
    }

    pub fn object_key(remote_id: &str, content_hash: &str) -> String {
        let id_hash = hex::encode(Sha256::digest(remote_id.as_bytes()));
        let prefix_len = content_hash.len().min(16);
        format!("{}-{}", id_hash, &content_hash[..prefix_len])
    }

    /// Final location of the object for `remote_id` with the given content.
    pub fn object_path_for(&self, remote_id: &str, content_hash: &str, extension: &str) -> PathBuf {
        let key = Self::object_key(remote_id, content_hash);
        self.objects_dir()
            .join(&key[..2])
            .join(format!("{}.{}", key, extension))
    }

    pub fn sidecar_path(object: &Path) -> PathBuf {
        let mut name = object.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    pub fn is_sidecar(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(SIDECAR_SUFFIX))
            .unwrap_or(false)
    }

    /// Object path a sidecar describes.
    pub fn object_for_sidecar(sidecar: &Path) -> Option<PathBuf> {
        let name = sidecar.to_str()?;
        name.strip_suffix(SIDECAR_SUFFIX).map(PathBuf::from)
    }

    /// Open a new temp file under `tmp/`.
    pub async fn stage(&self) -> Result<StagingFile> {
        let path = self
            .tmp_dir()
            .join(format!("{}.{}", Uuid::new_v4(), PART_EXTENSION));
        let file = File::create(&path)
            .await
            .map_err(|e| CacheError::from_write(e, &path))?;

        Ok(StagingFile {
            file,
            hasher: Sha256::new(),
            written: 0,
            guard: TempGuard::new(path),
        })
    }

    /// Write the sidecar for `entry` and rename the staged bytes to
    /// `entry.local_path`.
    pub async fn publish(&self, mut staged: StagedObject, entry: &CacheEntry) -> Result<PathBuf> {
        let target = entry.local_path.clone();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let record = SidecarRecord::from(entry);
        let sidecar = serde_json::to_vec_pretty(&record)?;
        write_atomic(&Self::sidecar_path(&target), &sidecar).await?;

        fs::rename(&staged.guard.path, &target)
            .await
            .map_err(|e| CacheError::from_write(e, &target))?;
        staged.guard.disarm();

        debug!(remote_id = %entry.remote_id, path = %target.display(), "Published object");
        Ok(target)
    }

    /// Whether a regular file of `byte_size` bytes sits at `object`.
    pub async fn object_present(&self, object: &Path, byte_size: u64) -> Result<bool> {
        match fs::metadata(object).await {
            Ok(meta) => Ok(meta.is_file() && meta.len() == byte_size),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move `object` into `tmp/` so its removal can still be undone.
    ///
    /// An object that is already missing detaches as nothing.
    pub async fn detach_object(&self, object: &Path) -> Result<DetachedObject> {
        let parked = self
            .tmp_dir()
            .join(format!("{}.{}", Uuid::new_v4(), DETACHED_EXTENSION));
        match fs::rename(object, &parked).await {
            Ok(()) => Ok(DetachedObject {
                original: object.to_path_buf(),
                parked: Some(parked),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DetachedObject {
                original: object.to_path_buf(),
                parked: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an object and its sidecar. Missing files are not an error.
    pub async fn delete_object(&self, object: &Path) -> Result<()> {
        remove_if_exists(object).await?;
        remove_if_exists(&Self::sidecar_path(object)).await?;
        Ok(())
    }

    pub async fn read_sidecar(&self, object: &Path) -> Result<Option<SidecarRecord>> {
        match fs::read(Self::sidecar_path(object)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every file under `objects/`, split into objects and sidecars.
    pub async fn scan(&self) -> Result<ObjectScan> {
        let mut scan = ObjectScan::default();
        let mut pending = vec![self.objects_dir()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if Self::is_sidecar(&path) {
                    scan.sidecars.push(path);
                } else {
                    scan.objects.push(path);
                }
            }
        }

        scan.objects.sort();
        scan.sidecars.sort();
        Ok(scan)
    }

    /// Delete every leftover temp file. Returns how many were removed.
    pub async fn clear_tmp(&self) -> Result<u64> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(self.tmp_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(self.tmp_dir()).await?;
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
        Ok(removed)
    }

    /// Drop `objects/` and `tmp/` wholesale and recreate them empty.
    pub async fn wipe(&self) -> Result<()> {
        for dir in [self.objects_dir(), self.tmp_dir()] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.ensure_layout().await
    }
}

/// Object moved out of `objects/` pending the manifest commit that drops it.
///
/// Startup reconciliation clears `tmp/`, so a detached object left behind by
/// a crash is removed with the rest.
#[derive(Debug)]
#[must_use = "a detached object must be restored or discarded"]
pub struct DetachedObject {
    original: PathBuf,
    parked: Option<PathBuf>,
}

impl DetachedObject {
    /// Put the object back where it was.
    pub async fn restore(self) -> Result<()> {
        if let Some(parked) = &self.parked {
            fs::rename(parked, &self.original).await?;
        }
        Ok(())
    }

    /// Delete the object and its sidecar. Leftovers are logged and left for
    /// reconciliation.
    pub async fn discard(self) {
        if let Some(parked) = &self.parked {
            if let Err(e) = remove_if_exists(parked).await {
                warn!(path = %parked.display(), error = %e, "Failed to delete detached object");
            }
        }
        let sidecar = ContentStore::sidecar_path(&self.original);
        if let Err(e) = remove_if_exists(&sidecar).await {
            warn!(path = %sidecar.display(), error = %e, "Failed to delete sidecar");
        }
    }
}

/// Streaming writer for a download in progress.
///
/// The temp file is removed if the writer is dropped before `finish`.
pub struct StagingFile {
    file: File,
    hasher: Sha256,
    written: u64,
    guard: TempGuard,
}

impl StagingFile {
    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| CacheError::from_write(e, &self.guard.path))?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and fsync the temp file.
    pub async fn finish(mut self) -> Result<StagedObject> {
        self.file
            .flush()
            .await
            .map_err(|e| CacheError::from_write(e, &self.guard.path))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| CacheError::from_write(e, &self.guard.path))?;

        Ok(StagedObject {
            content_hash: format!("{:x}", self.hasher.finalize()),
            byte_size: self.written,
            guard: self.guard,
        })
    }

    pub async fn discard(self) {
        self.guard.remove().await;
    }
}

/// Fully written, fsynced temp file waiting to be published.
#[derive(Debug)]
pub struct StagedObject {
    content_hash: String,
    byte_size: u64,
    guard: TempGuard,
}

impl StagedObject {
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn temp_path(&self) -> &Path {
        &self.guard.path
    }

    /// Check the staged bytes against what the catalog announced.
    pub fn verify(
        &self,
        remote_id: &str,
        expected_size: Option<u64>,
        expected_hash: Option<&str>,
    ) -> Result<()> {
        if let Some(expected) = expected_size {
            if expected != self.byte_size {
                return Err(CacheError::AssetCorrupt {
                    remote_id: remote_id.to_string(),
                    reason: format!("expected {} bytes, received {}", expected, self.byte_size),
                });
            }
        }

        if let Some(expected) = expected_hash {
            if !expected.eq_ignore_ascii_case(&self.content_hash) {
                return Err(CacheError::AssetCorrupt {
                    remote_id: remote_id.to_string(),
                    reason: format!("expected sha256 {}, computed {}", expected, self.content_hash),
                });
            }
        }

        Ok(())
    }

    pub async fn discard(self) {
        self.guard.remove().await;
    }
}

#[derive(Debug)]
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn remove(mut self) {
        if let Err(e) = remove_if_exists(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
        }
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// File extension for an object, from the filename or else the MIME type.
pub fn extension_for(filename: Option<&str>, mime_type: Option<&str>) -> String {
    let from_name = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase());

    if let Some(ext) = from_name {
        return ext;
    }

    match mime_type.map(|m| m.to_ascii_lowercase()).as_deref() {
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        Some("image/heic") | Some("image/heif") => "heic",
        Some("video/mp4") => "mp4",
        Some("video/quicktime") => "mov",
        _ => "bin",
    }
    .to_string()
}

/// SHA-256 and length of a file, read in chunks.
pub async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Replace `path` with `bytes` via a fsynced sibling temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let result = async {
        let mut file = File::create(&temp)
            .await
            .map_err(|e| CacheError::from_write(e, &temp))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CacheError::from_write(e, &temp))?;
        file.sync_all()
            .await
            .map_err(|e| CacheError::from_write(e, &temp))?;
        fs::rename(&temp, path)
            .await
            .map_err(|e| CacheError::from_write(e, path))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
