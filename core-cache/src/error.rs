//! Cache Error Types

use std::path::Path;
use thiserror::Error;

/// ENOSPC on Linux and macOS.
const ENOSPC: i32 = 28;

#[derive(Error, Debug)]
pub enum CacheError {
    // ========================================================================
    // Content Errors
    // ========================================================================
    #[error("Asset corrupt for {remote_id}: {reason}")]
    AssetCorrupt { remote_id: String, reason: String },

    #[error("Disk full while writing {path}")]
    DiskFull { path: String },

    // ========================================================================
    // Manifest Errors
    // ========================================================================
    #[error("Cache manifest corrupted: {0}")]
    ManifestCorruption(String),

    #[error("Entry not cached: {0}")]
    NotCached(String),

    #[error("Entry {0} is being evicted")]
    EvictionInProgress(String),

    // ========================================================================
    // Quota Errors
    // ========================================================================
    #[error(
        "Quota unenforceable: {total_bytes} bytes cached ({pinned_bytes} pinned), quota {quota_bytes}"
    )]
    QuotaUnenforceable {
        pinned_bytes: u64,
        total_bytes: u64,
        quota_bytes: u64,
    },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Map an I/O error raised while writing `path`, surfacing a full disk.
    pub fn from_write(error: std::io::Error, path: &Path) -> Self {
        if error.raw_os_error() == Some(ENOSPC) {
            CacheError::DiskFull {
                path: path.display().to_string(),
            }
        } else {
            CacheError::Io(error)
        }
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, CacheError::DiskFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
