//! Google Photos Library API request and response types
//!
//! See: https://developers.google.com/photos/library/reference/rest

use bridge_traits::catalog::{GeoLocation, PhotoDetails};
use serde::{Deserialize, Serialize};

/// Body of `mediaItems:search`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMediaItemsRequest<'a> {
    pub album_id: &'a str,
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<&'a str>,
}

/// Response of `mediaItems:search`
///
/// `mediaItems` is omitted entirely for an empty album.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMediaItemsResponse {
    #[serde(default)]
    pub media_items: Vec<MediaItem>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Media item resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    /// Short-lived download base; append `=w<width>` to fetch a photo
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub media_metadata: Option<MediaMetadata>,
    /// Caption entered by the owner
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl MediaItem {
    /// Caption, place and pixel dimensions of the item.
    pub fn details(&self) -> PhotoDetails {
        let metadata = self.media_metadata.as_ref();
        PhotoDetails {
            description: self
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            location: self.location.as_ref().and_then(Location::to_geo),
            width: metadata.and_then(|m| parse_dimension(m.width.as_deref())),
            height: metadata.and_then(|m| parse_dimension(m.height.as_deref())),
        }
    }
}

fn parse_dimension(value: Option<&str>) -> Option<u32> {
    value?.parse().ok().filter(|v| *v > 0)
}

/// Location block of a media item
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default)]
    pub lat_lng: Option<LatLng>,
    #[serde(default)]
    pub location_name: Option<String>,
}

impl Location {
    fn to_geo(&self) -> Option<GeoLocation> {
        let lat_lng = self.lat_lng.as_ref()?;
        let name = self
            .location_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        GeoLocation::new(lat_lng.latitude?, lat_lng.longitude?, name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatLng {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// Metadata block of a media item. Dimensions arrive as strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    /// RFC 3339
    #[serde(default)]
    pub creation_time: Option<String>,
    #[serde(default)]
    pub width: Option<String>,
    #[serde(default)]
    pub height: Option<String>,
}

/// Response of `albums.list`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAlbumsResponse {
    #[serde(default)]
    pub albums: Vec<Album>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Album resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Decimal string
    #[serde(default)]
    pub media_items_count: Option<String>,
    #[serde(default)]
    pub cover_photo_base_url: Option<String>,
}

/// Google API error envelope
#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}
