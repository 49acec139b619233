//! Google Photos Library API connector
//!
//! Implements [`RemoteCatalog`] on top of the Library API v1.

use async_trait::async_trait;
use bridge_traits::catalog::{
    AssetStream, CatalogPage, CatalogResult, RemoteAlbum, RemoteCatalog, RemoteItem,
};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use chrono::{DateTime, Utc};
use core_auth::TokenSource;
use core_runtime::config::SyncTuning;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::backoff;
use crate::error::{GooglePhotosError, Result};
use crate::types::{
    ApiErrorResponse, ListAlbumsResponse, MediaItem, SearchMediaItemsRequest,
    SearchMediaItemsResponse,
};

/// Library API base URL
pub const PHOTOS_API_BASE: &str = "https://photoslibrary.googleapis.com/v1";

/// Maximum media items per search page (API limit)
const MEDIA_PAGE_SIZE: u32 = 100;

/// Maximum albums per page (API limit)
const ALBUM_PAGE_SIZE: u32 = 50;

/// Request shaping for [`GooglePhotosCatalog`].
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub api_base: String,
    /// Pixel width requested for photo downloads
    pub download_width: u32,
    /// Retries after the first attempt for rate-limited or failing calls
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub listing_timeout: Duration,
    pub download_timeout: Duration,
}

impl CatalogConfig {
    pub fn from_tuning(tuning: &SyncTuning) -> Self {
        Self {
            api_base: PHOTOS_API_BASE.to_string(),
            download_width: tuning.download_width,
            max_retries: tuning.max_listing_retries,
            backoff_base: tuning.backoff_base,
            backoff_cap: tuning.backoff_cap,
            listing_timeout: tuning.listing_timeout,
            download_timeout: tuning.download_timeout,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self::from_tuning(&SyncTuning::default())
    }
}

/// Outcome of a single request attempt.
enum Attempt<T> {
    Done(T),
    Fatal(GooglePhotosError),
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
}

/// Google Photos catalog
///
/// # Features
///
/// - Paginated album listing through `mediaItems:search`
/// - Streaming asset downloads at a configured width
/// - Exponential backoff with full jitter for 429, 5xx and transport failures
/// - Bearer tokens from a [`TokenSource`]; a rejected or expired token
///   surfaces as `AuthExpired` and is never refreshed here
///
/// # Example
///
/// ```ignore
/// use provider_google_photos::{CatalogConfig, GooglePhotosCatalog};
/// use bridge_traits::catalog::RemoteCatalog;
///
/// let catalog = GooglePhotosCatalog::new(http_client, credential_store, CatalogConfig::default());
/// let page = catalog.list_album_items("album-id", None).await?;
/// ```
pub struct GooglePhotosCatalog {
    http_client: Arc<dyn HttpClient>,
    tokens: Arc<dyn TokenSource>,
    config: CatalogConfig,
}

impl GooglePhotosCatalog {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        tokens: Arc<dyn TokenSource>,
        config: CatalogConfig,
    ) -> Self {
        Self {
            http_client,
            tokens,
            config,
        }
    }

    /// Download URL for an item: photos at the configured width, videos as
    /// the original stream.
    pub fn asset_url(&self, item: &RemoteItem) -> String {
        let is_video = item
            .mime_type
            .as_deref()
            .map(|mime| mime.starts_with("video/"))
            .unwrap_or(false);
        if is_video {
            format!("{}=dv", item.download_url)
        } else {
            format!("{}=w{}", item.download_url, self.config.download_width)
        }
    }

    fn parse_timestamp(rfc3339: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(rfc3339)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Convert a media item; items without a download base are dropped.
    fn convert_item(&self, album_id: &str, item: MediaItem) -> Option<RemoteItem> {
        let details = item.details();
        let Some(base_url) = item.base_url else {
            warn!(remote_id = %item.id, "Media item has no baseUrl, skipping");
            return None;
        };

        let modified_at = item
            .media_metadata
            .as_ref()
            .and_then(|m| m.creation_time.as_deref())
            .and_then(Self::parse_timestamp)
            .unwrap_or_default();

        Some(RemoteItem {
            remote_id: item.id,
            album_id: album_id.to_string(),
            content_hash: None,
            etag: None,
            byte_size: None,
            modified_at,
            download_url: base_url,
            filename: item.filename,
            mime_type: item.mime_type,
            details,
        })
    }

    async fn bearer(&self) -> Result<String> {
        Ok(self.tokens.access_token().await?)
    }

    /// Run `attempt` with a fresh bearer token until it succeeds, fails
    /// permanently, or the retry ceiling is reached.
    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut retries = 0u32;
        loop {
            let token = self.bearer().await?;
            match attempt(token).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(error) => return Err(error),
                Attempt::Retry {
                    reason,
                    retry_after,
                } => {
                    if retries >= self.config.max_retries {
                        warn!(operation, attempts = retries + 1, reason = %reason, "Giving up");
                        return Err(GooglePhotosError::Exhausted {
                            attempts: retries + 1,
                            last_error: reason,
                        });
                    }

                    let delay = backoff::delay_for(
                        retries,
                        self.config.backoff_base,
                        self.config.backoff_cap,
                        retry_after,
                    );
                    warn!(
                        operation,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Request failed, backing off"
                    );
                    sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }

    /// Execute a JSON API call under the listing timeout and retry rules.
    async fn send_api(&self, operation: &'static str, request: HttpRequest) -> Result<HttpResponse> {
        let limit = self.config.listing_timeout;
        self.with_retries(operation, |token| {
            let request = request.clone().bearer_token(token).timeout(limit);
            let http_client = Arc::clone(&self.http_client);
            async move {
                match timeout(
                    limit,
                    http_client.execute_with_retry(request, RetryPolicy::no_retry()),
                )
                .await
                {
                    Err(_) => Attempt::Retry {
                        reason: format!("timed out after {}s", limit.as_secs()),
                        retry_after: None,
                    },
                    Ok(Err(e)) => Attempt::Retry {
                        reason: e.to_string(),
                        retry_after: None,
                    },
                    Ok(Ok(response)) if response.is_success() => Attempt::Done(response),
                    Ok(Ok(response)) => classify_failure(
                        response.status,
                        response.header("Retry-After"),
                        api_message(&response),
                    ),
                }
            }
        })
        .await
    }

    async fn search_album(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> Result<CatalogPage> {
        let body = SearchMediaItemsRequest {
            album_id,
            page_size: MEDIA_PAGE_SIZE,
            page_token,
        };
        let request = HttpRequest::new(
            HttpMethod::Post,
            format!("{}/mediaItems:search", self.config.api_base),
        )
        .header("Accept", "application/json")
        .json(&body)?;

        let response = self.send_api("mediaItems.search", request).await?;
        let search: SearchMediaItemsResponse = serde_json::from_slice(&response.body)
            .map_err(|e| {
                GooglePhotosError::ParseError(format!("Failed to parse media items: {}", e))
            })?;

        let listed = search.media_items.len();
        let items: Vec<RemoteItem> = search
            .media_items
            .into_iter()
            .filter_map(|item| self.convert_item(album_id, item))
            .collect();

        debug!(
            listed,
            kept = items.len(),
            has_next = search.next_page_token.is_some(),
            "Album page listed"
        );

        Ok(CatalogPage {
            items,
            next_page_token: search.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn fetch_albums(&self) -> Result<Vec<RemoteAlbum>> {
        let mut albums = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", ALBUM_PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let url = url::Url::parse_with_params(
                &format!("{}/albums", self.config.api_base),
                &query,
            )
            .map_err(|e| GooglePhotosError::ParseError(format!("Invalid albums URL: {}", e)))?;

            let request = HttpRequest::new(HttpMethod::Get, url.to_string())
                .header("Accept", "application/json");
            let response = self.send_api("albums.list", request).await?;
            let page: ListAlbumsResponse = serde_json::from_slice(&response.body).map_err(|e| {
                GooglePhotosError::ParseError(format!("Failed to parse albums: {}", e))
            })?;

            albums.extend(page.albums.into_iter().map(|album| RemoteAlbum {
                title: album.title.unwrap_or_else(|| album.id.clone()),
                album_id: album.id,
                item_count: album.media_items_count.and_then(|c| c.parse().ok()),
                cover_url: album.cover_photo_base_url,
            }));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(albums)
    }

    async fn download(&self, item: &RemoteItem) -> Result<AssetStream> {
        let url = self.asset_url(item);
        let limit = self.config.download_timeout;

        let download = self
            .with_retries("asset.download", |token| {
                let request = HttpRequest::new(HttpMethod::Get, url.clone())
                    .bearer_token(token)
                    .timeout(limit);
                let http_client = Arc::clone(&self.http_client);
                async move {
                    match timeout(limit, http_client.download_stream(request)).await {
                        Err(_) => Attempt::Retry {
                            reason: format!("timed out after {}s", limit.as_secs()),
                            retry_after: None,
                        },
                        Ok(Err(e)) => Attempt::Retry {
                            reason: e.to_string(),
                            retry_after: None,
                        },
                        Ok(Ok(download)) if download.is_success() => Attempt::Done(download),
                        Ok(Ok(download)) => classify_failure(
                            download.status,
                            download.header("Retry-After"),
                            format!("asset download returned {}", download.status),
                        ),
                    }
                }
            })
            .await?;

        Ok(AssetStream {
            content_length: download.content_length,
            reader: download.body,
        })
    }
}

/// Map a non-success status to an attempt outcome.
fn classify_failure<T>(status: u16, retry_after: Option<&str>, detail: String) -> Attempt<T> {
    match status {
        401 | 403 => Attempt::Fatal(GooglePhotosError::AuthenticationRejected {
            status_code: status,
        }),
        404 => Attempt::Fatal(GooglePhotosError::NotFound(detail)),
        429 | 500..=599 => Attempt::Retry {
            reason: format!("HTTP {}: {}", status, detail),
            retry_after: backoff::parse_retry_after(retry_after),
        },
        _ => Attempt::Fatal(GooglePhotosError::ApiError {
            status_code: status,
            message: detail,
        }),
    }
}

fn api_message(response: &HttpResponse) -> String {
    match response.json::<ApiErrorResponse>() {
        Ok(envelope) => envelope.error.message,
        Err(_) => String::from_utf8_lossy(&response.body)
            .chars()
            .take(200)
            .collect(),
    }
}

#[async_trait]
impl RemoteCatalog for GooglePhotosCatalog {
    #[instrument(skip(self, page_token), fields(album_id = %album_id, has_token = page_token.is_some()))]
    async fn list_album_items(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> CatalogResult<CatalogPage> {
        self.search_album(album_id, page_token)
            .await
            .map_err(|e| {
                warn!(error = %e, "Album listing failed");
                e.into()
            })
    }

    #[instrument(skip(self, item), fields(remote_id = %item.remote_id))]
    async fn open_asset(&self, item: &RemoteItem) -> CatalogResult<AssetStream> {
        let stream = self.download(item).await.map_err(|e| {
            warn!(error = %e, "Asset download failed to start");
            e
        })?;
        debug!(content_length = ?stream.content_length, "Asset stream opened");
        Ok(stream)
    }

    #[instrument(skip(self))]
    async fn list_albums(&self) -> CatalogResult<Vec<RemoteAlbum>> {
        let albums = self.fetch_albums().await?;
        info!(count = albums.len(), "Listed albums");
        Ok(albums)
    }
}
