//! Cache statistics

use crate::manifest::ManifestSnapshot;
use serde::{Deserialize, Serialize};

/// Statistics about the local cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached entries
    pub entry_count: usize,

    /// Entries belonging to an active album
    pub pinned_entries: usize,

    /// Sum of all entry sizes
    pub total_bytes: u64,

    /// Sum of pinned entry sizes
    pub pinned_bytes: u64,

    /// Items skipped until they change remotely
    pub parked_items: usize,

    /// Open read leases
    pub active_leases: usize,

    /// Timestamp when stats were calculated
    pub calculated_at: i64,
}

impl CacheStats {
    pub fn from_snapshot(snapshot: &ManifestSnapshot, active_leases: usize, calculated_at: i64) -> Self {
        Self {
            entry_count: snapshot.len(),
            pinned_entries: snapshot.entries().filter(|e| e.pinned).count(),
            total_bytes: snapshot.total_bytes(),
            pinned_bytes: snapshot.pinned_bytes(),
            parked_items: snapshot.parked_count(),
            active_leases,
            calculated_at,
        }
    }

    /// Calculate cache usage as a percentage of the quota.
    pub fn usage_percentage(&self, quota_bytes: u64) -> f64 {
        if quota_bytes == 0 {
            return 0.0;
        }

        (self.total_bytes as f64 / quota_bytes as f64) * 100.0
    }

    /// Returns true if the cache is near capacity (>90%).
    pub fn is_near_capacity(&self, quota_bytes: u64) -> bool {
        self.usage_percentage(quota_bytes) > 90.0
    }

    /// Returns true if the cache is full (>=100%).
    pub fn is_full(&self, quota_bytes: u64) -> bool {
        self.total_bytes >= quota_bytes
    }

    /// Bytes over the quota.
    pub fn space_needed(&self, quota_bytes: u64) -> u64 {
        self.total_bytes.saturating_sub(quota_bytes)
    }

    /// Bytes eviction could never reclaim exceed the quota.
    pub fn pinned_exceeds(&self, quota_bytes: u64) -> bool {
        self.pinned_bytes > quota_bytes
    }

    pub fn average_entry_size(&self) -> u64 {
        if self.entry_count == 0 {
            0
        } else {
            self.total_bytes / self.entry_count as u64
        }
    }
}
