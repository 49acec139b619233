//! # Sync Cycle Records
//!
//! Identity and outcome of one sync cycle.

use chrono::{DateTime, Utc};
use core_cache::QuotaShortfall;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters accumulated over one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    /// Distinct remote items seen across active albums
    pub listed: u64,
    pub unchanged: u64,
    pub downloaded: u64,
    pub bytes_downloaded: u64,
    /// Downloads that failed and were recorded in the failure ledger
    pub failed: u64,
    /// Downloads abandoned for reasons unrelated to the item
    pub skipped: u64,
    /// Downloads discarded because no room could be made
    pub rejected: u64,
    pub removed: u64,
    pub relabeled: u64,
    pub evicted: u64,
    /// Items newly parked this cycle
    pub parked: u64,
    /// Parked items left out of the plan
    pub parked_skipped: u64,
    pub orphans_removed: u64,
}

// ============================================================================
// Report
// ============================================================================

/// Outcome of a finished cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: CycleStats,
    /// Albums whose listing stopped early, with the reason
    pub listing_errors: Vec<(String, String)>,
    #[serde(skip)]
    pub quota_shortfall: Option<QuotaShortfall>,
    /// Set when the cycle did nothing, e.g. no album is selected
    pub skipped_reason: Option<String>,
}

impl CycleReport {
    pub fn new(cycle_id: CycleId, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            stats: CycleStats::default(),
            listing_errors: Vec::new(),
            quota_shortfall: None,
            skipped_reason: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    /// Problem worth surfacing in the sync status, if any.
    pub fn warning(&self) -> Option<String> {
        if let Some((album_id, reason)) = self.listing_errors.first() {
            return Some(format!("Listing of album {} incomplete: {}", album_id, reason));
        }
        self.quota_shortfall.map(|s| {
            format!(
                "Cache quota cannot be enforced: {} bytes cached, {} pinned, quota {}",
                s.total_bytes, s.pinned_bytes, s.quota_bytes
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_cycle_ids_are_unique() {
        assert_ne!(CycleId::new(), CycleId::new());
    }

    #[test]
    fn test_report_duration_and_warning() {
        let start = Utc.with_ymd_and_hms(2024, 2, 2, 10, 0, 0).unwrap();
        let mut report = CycleReport::new(CycleId::new(), start);
        report.finished_at = start + Duration::milliseconds(1500);
        assert_eq!(report.duration_ms(), 1500);
        assert_eq!(report.warning(), None);

        report.quota_shortfall = Some(QuotaShortfall {
            pinned_bytes: 10,
            total_bytes: 12,
            quota_bytes: 8,
        });
        assert!(report.warning().unwrap().contains("quota"));

        report
            .listing_errors
            .push(("album-1".into(), "Remote unavailable".into()));
        assert!(report.warning().unwrap().starts_with("Listing of album album-1"));
    }
}
