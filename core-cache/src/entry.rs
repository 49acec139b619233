//! Cached item records

use bridge_traits::catalog::PhotoDetails;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One locally available asset.
///
/// An entry only exists once its object has been durably published in the
/// content store. `pinned` always reflects whether `album_id` is in the
/// manifest's active album set; the manifest recomputes it on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub remote_id: String,
    pub album_id: String,
    /// Absolute path of the published object
    pub local_path: PathBuf,
    pub byte_size: u64,
    /// Lowercase hex SHA-256 of the stored bytes
    pub content_hash: String,
    /// Remote fingerprint (`sha256:`, `etag:` or `mtime:` form) at fetch time
    pub remote_version: String,
    pub remote_modified_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Caption, place and dimensions as listed at fetch time
    #[serde(default, skip_serializing_if = "PhotoDetails::is_empty")]
    pub details: PhotoDetails,
}

/// Per-item download failure ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Consecutive failures against `fingerprint`
    pub failures: u32,
    /// Remote version the failures were observed against
    pub fingerprint: String,
    pub last_error: String,
    /// Parked items are skipped until their fingerprint changes
    pub parked: bool,
}

impl FailureRecord {
    pub fn first(fingerprint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            failures: 1,
            fingerprint: fingerprint.into(),
            last_error: error.into(),
            parked: false,
        }
    }

    /// Whether this record still applies to a remote item at `fingerprint`.
    pub fn matches(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
    }
}
