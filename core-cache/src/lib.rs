//! # Core Cache
//!
//! Bounded, content-addressed local cache of remote photos.
//!
//! ## Overview
//!
//! - [`CacheManifest`]: authoritative `remote_id → CacheEntry` map with the
//!   failure ledger and active album set, persisted as `manifest.json`
//! - [`ContentStore`]: temp staging, fsync, sidecar records and atomic
//!   publish into `objects/<hh>/<key>.<ext>`
//! - [`LeaseTable`]: read leases that protect files in use
//! - [`EvictionPolicy`]: least-recently-used eviction that never touches
//!   pinned or leased entries
//! - [`reconcile`]: startup reconciliation, sidecar rebuild, orphan sweep
//! - [`LocalCache`]: the handle tying these together

pub mod cache;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod lease;
pub mod manifest;
pub mod reconcile;
pub mod stats;
pub mod store;

pub use cache::{Admission, LocalCache};
pub use entry::{CacheEntry, FailureRecord};
pub use error::{CacheError, Result};
pub use eviction::{EvictionPolicy, EvictionReport, QuotaShortfall};
pub use lease::{LeaseTable, ReadLease};
pub use manifest::{CacheManifest, ManifestChange, ManifestSnapshot, MANIFEST_VERSION};
pub use reconcile::ReconcileReport;
pub use stats::CacheStats;
pub use store::{
    extension_for, ContentStore, DetachedObject, SidecarRecord, StagedObject, StagingFile,
};
