//! # Authentication Module
//!
//! Credential handling for the photo library.
//!
//! ## Overview
//!
//! The device holds exactly one OAuth credential. This crate runs the
//! authorization code flow (with PKCE) that produces it, keeps it in the
//! host's secure store, and refreshes the access token on request.
//!
//! ## Features
//!
//! - OAuth 2.0 authorization flow with PKCE support
//! - Caller-driven, single-flight token refresh ([`TokenSource`])
//! - Secure credential storage via the platform [`SecureStore`](bridge_traits::SecureStore)
//! - Auth state event emission

pub mod credential_store;
pub mod error;
pub mod oauth;
pub mod token_store;
pub mod types;

pub use credential_store::{CredentialStore, TokenSource};
pub use error::{AuthError, Result};
pub use oauth::{OAuthConfig, OAuthFlowManager, PkceVerifier, TokenGrant};
pub use token_store::{TokenStore, CREDENTIAL_KEY};
pub use types::{Credential, CredentialState, REFRESH_BUFFER_SECS};
