//! # Google Photos Provider
//!
//! Implements [`RemoteCatalog`](bridge_traits::catalog::RemoteCatalog) for the
//! Google Photos Library API v1.
//!
//! ## Overview
//!
//! This module provides:
//! - Album item listing through `mediaItems:search`, one page per call
//! - Album discovery so a host can offer choices
//! - Streaming photo downloads at a requested width
//! - Rate limiting and exponential backoff with full jitter
//!
//! Authorization is handled by `core-auth`; this crate only reads the
//! current access token and reports rejections.

pub mod backoff;
pub mod connector;
pub mod error;
pub mod types;

pub use connector::{CatalogConfig, GooglePhotosCatalog, PHOTOS_API_BASE};
pub use error::{GooglePhotosError, Result};
