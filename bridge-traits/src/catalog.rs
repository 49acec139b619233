//! Remote Photo Catalog Abstraction
//!
//! The seam between the sync engine and a remote, OAuth-protected photo
//! library. Providers implement [`RemoteCatalog`]; the engine only sees
//! [`RemoteItem`]s, pages and asset streams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Errors surfaced by a remote catalog.
///
/// The variants are the ones the sync engine reacts to differently; anything
/// else is folded into `RemoteUnavailable` or `InvalidResponse`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The bearer credential was rejected (HTTP 401/403) or is known to be
    /// expired. The caller refreshes and repeats the same request.
    #[error("Access token expired or rejected")]
    AuthExpired,

    /// No credential is available at all; re-authorization is required.
    #[error("Credential revoked or missing: {0}")]
    AuthRevoked(String),

    /// Rate limiting or server errors persisted past the retry ceiling, or the
    /// network is unreachable.
    #[error("Remote catalog unavailable: {0}")]
    RemoteUnavailable(String),

    /// The album or item no longer exists remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The catalog answered with something we could not interpret.
    #[error("Invalid catalog response: {0}")]
    InvalidResponse(String),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// One asset as reported by the remote listing.
///
/// Identity is `remote_id`; uniqueness is the catalog's guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub remote_id: String,
    pub album_id: String,
    /// Lowercase hex SHA-256 of the asset bytes, when the catalog exposes one
    pub content_hash: Option<String>,
    /// Opaque version token, when the catalog exposes one
    pub etag: Option<String>,
    pub byte_size: Option<u64>,
    pub modified_at: DateTime<Utc>,
    pub download_url: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "PhotoDetails::is_empty")]
    pub details: PhotoDetails,
}

/// Caption, place and dimensions shown alongside a photo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl PhotoDetails {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.location.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }
}

/// Where a photo was taken, in WGS 84 degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl GeoLocation {
    /// `None` unless both coordinates are finite and in range.
    pub fn new(latitude: f64, longitude: f64, name: Option<String>) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
            name,
        })
    }
}

// Coordinates are always finite, so equality is reflexive.
impl Eq for GeoLocation {}

impl RemoteItem {
    /// Strongest version identity available for this item.
    ///
    /// Used to decide whether a parked item changed remotely.
    pub fn fingerprint(&self) -> String {
        if let Some(hash) = &self.content_hash {
            format!("sha256:{}", hash)
        } else if let Some(etag) = &self.etag {
            format!("etag:{}", etag)
        } else {
            format!(
                "mtime:{}:{}",
                self.modified_at.timestamp_millis(),
                self.byte_size
                    .map(|size| size.to_string())
                    .unwrap_or_else(|| "?".to_string())
            )
        }
    }
}

/// One page of an album listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogPage {
    pub items: Vec<RemoteItem>,
    pub next_page_token: Option<String>,
}

impl CatalogPage {
    pub fn is_last(&self) -> bool {
        self.next_page_token
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true)
    }
}

/// A remote album the user could select for the slideshow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAlbum {
    pub album_id: String,
    pub title: String,
    pub item_count: Option<u64>,
    pub cover_url: Option<String>,
}

/// Open download of a single asset.
pub struct AssetStream {
    /// Length advertised by the server, if any
    pub content_length: Option<u64>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for AssetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Remote catalog trait
///
/// `list_album_items` must be called until `next_page_token` is empty to
/// obtain a complete album; a partial listing is never complete. On
/// [`CatalogError::AuthExpired`] implementations do not retry or refresh on
/// their own.
///
/// Implementations bound each network request with their own timeout and
/// retry transient failures up to their ceiling before returning
/// `RemoteUnavailable`. Callers do not wrap these calls in a timeout.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// List one page of an album.
    async fn list_album_items(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> CatalogResult<CatalogPage>;

    /// Open a streaming download for an item.
    async fn open_asset(&self, item: &RemoteItem) -> CatalogResult<AssetStream>;

    /// List albums available to the signed-in user.
    async fn list_albums(&self) -> CatalogResult<Vec<RemoteAlbum>> {
        Ok(Vec::new())
    }
}
