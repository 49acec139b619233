//! # Host Bridge Traits
//!
//! Platform abstraction traits that the host (the slideshow device runtime)
//! implements for the sync core.
//!
//! ## Overview
//!
//! This crate defines the contract between the core library and
//! platform-specific implementations. Each trait represents a capability that
//! the core requires but that is provided differently per deployment
//! (desktop defaults live in `bridge-desktop`).
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP operations with retry and streamed downloads
//! - [`RemoteCatalog`](catalog::RemoteCatalog) - Paginated remote photo listing and asset download
//!
//! ### Security & Storage
//! - [`SecureStore`](storage::SecureStore) - Credential persistence
//! - [`SettingsStore`](storage::SettingsStore) - Key-value settings written by the session layer
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Platform bridges use [`BridgeError`](error::BridgeError). The catalog seam
//! has its own [`CatalogError`](catalog::CatalogError) because the sync
//! engine reacts to auth expiry and rate limiting differently from other
//! failures.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod catalog;
pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use catalog::{
    AssetStream, CatalogError, CatalogPage, CatalogResult, GeoLocation, PhotoDetails, RemoteAlbum,
    RemoteCatalog, RemoteItem,
};
pub use http::{HttpClient, HttpDownload, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use storage::{SecureStore, SettingsStore};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
