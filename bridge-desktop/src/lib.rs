//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for Linux display devices and
//! desktop development machines.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` (rustls, streamed downloads)
//! - `SecureStore` using the `keyring` crate (feature `secure-store`)
//! - `SecureStore` using a private JSON token file, for headless kiosks
//! - `SettingsStore` using a SQLite-backed key-value store
//! - `AppDirectories` resolving default cache/data locations
//!
//! ## Feature Flags
//!
//! - `secure-store`: Enable OS keychain integration (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{AppDirectories, FileSecureStore, ReqwestHttpClient};
//!
//! let dirs = AppDirectories::resolve();
//! let http_client = ReqwestHttpClient::new()?;
//! let secrets = FileSecureStore::in_directory(dirs.tokens_dir());
//! ```

mod app_dirs;
mod file_store;
mod http;
mod settings;

#[cfg(feature = "secure-store")]
mod secure_store;

pub use app_dirs::AppDirectories;
pub use file_store::FileSecureStore;
pub use http::ReqwestHttpClient;
pub use settings::SqliteSettingsStore;

#[cfg(feature = "secure-store")]
pub use secure_store::KeyringSecureStore;
