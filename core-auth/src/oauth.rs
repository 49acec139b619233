//! OAuth 2.0 Authorization Flow with PKCE
//!
//! Implements the authorization code flow (RFC 6749) with PKCE (RFC 7636)
//! against the photo library's authorization server.
//!
//! - Builds the consent URL with an S256 challenge and CSRF state
//! - Exchanges the returned code for a [`TokenGrant`]
//! - Refreshes the access token, telling revocation apart from transient failure
//!
//! Token values, codes and verifiers are never logged.
//!
//! # Example
//!
//! ```no_run
//! use core_auth::oauth::{OAuthConfig, OAuthFlowManager};
//! use std::sync::Arc;
//!
//! # fn example(http_client: Arc<dyn bridge_traits::http::HttpClient>) -> core_auth::Result<()> {
//! let config = OAuthConfig::google_photos("client-id", None, "http://127.0.0.1:8765/callback");
//! let flow_manager = OAuthFlowManager::new(config, http_client);
//! let (auth_url, pkce_verifier) = flow_manager.build_auth_url()?;
//! println!("Open {auth_url}");
//! # let _ = pkce_verifier;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Read-only access to the user's photo library.
pub const PHOTOS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/photoslibrary.readonly";
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// OAuth 2.0 client configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Absent for public (installed-app) clients
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
}

impl OAuthConfig {
    /// Configuration for Google Photos with the read-only library scope.
    pub fn google_photos(
        client_id: impl Into<String>,
        client_secret: Option<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_uri: redirect_uri.into(),
            scopes: vec![PHOTOS_READONLY_SCOPE.to_string()],
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }
}

/// PKCE code verifier plus the CSRF state of one authorization attempt.
///
/// Only the challenge derived from the verifier leaves the device during
/// authorization; the verifier itself is sent with the code exchange.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
    state: String,
}

impl PkceVerifier {
    /// 32 random bytes for the verifier and 16 for the state, both
    /// base64url without padding.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        let mut verifier_bytes = [0u8; 32];
        rng.fill(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut state_bytes = [0u8; 16];
        rng.fill(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        Self { verifier, state }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// S256 challenge: BASE64URL(SHA256(verifier))
    pub fn challenge(&self) -> String {
        let hash = Sha256::digest(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .field("state", &self.state)
            .finish()
    }
}

/// Tokens issued by the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Runs the authorization code flow against one token endpoint.
pub struct OAuthFlowManager {
    config: OAuthConfig,
    http_client: Arc<dyn HttpClient>,
    request_timeout: Duration,
}

impl OAuthFlowManager {
    pub fn new(config: OAuthConfig, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            http_client,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Build the consent URL.
    ///
    /// Returns the URL and the verifier that must be kept until
    /// [`exchange_code`](Self::exchange_code). `access_type=offline` and
    /// `prompt=consent` make the server issue a refresh token on every grant.
    #[instrument(skip(self))]
    pub fn build_auth_url(&self) -> Result<(String, PkceVerifier)> {
        let verifier = PkceVerifier::new();
        let challenge = verifier.challenge();

        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| AuthError::Other(format!("Invalid auth URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", verifier.state())
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "offline")
            .append_pair("include_granted_scopes", "true")
            .append_pair("prompt", "consent");

        debug!("Built authorization URL");

        Ok((url.to_string(), verifier))
    }

    /// Exchange an authorization code for tokens after checking the state.
    #[instrument(skip(self, code, state, verifier))]
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        verifier: &PkceVerifier,
    ) -> Result<TokenGrant> {
        if state != verifier.state() {
            warn!("Authorization state mismatch");
            return Err(AuthError::InvalidState);
        }

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier.verifier()),
        ];
        if let Some(ref client_secret) = self.config.client_secret {
            params.push(("client_secret", client_secret.as_str()));
        }

        let encoded = serde_urlencoded::to_string(&params)
            .map_err(|e| AuthError::Other(format!("Failed to encode token request: {}", e)))?;

        debug!("Exchanging authorization code");

        let response = self
            .post_token_request(encoded)
            .await
            .map_err(|e| AuthError::NetworkError(e.to_string()))?;

        if !response.is_success() {
            let error = TokenErrorResponse::describe(&response);
            warn!(status = response.status, error = %error, "Authorization code rejected");
            return Err(AuthError::InvalidAuthCode(format!(
                "Token endpoint returned {}: {}",
                response.status, error
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .map_err(|e| AuthError::Other(format!("Failed to parse token response: {}", e)))?;

        if token_response.refresh_token.is_none() {
            warn!("Token endpoint did not issue a refresh token");
        }
        info!(
            expires_in = token_response.expires_in,
            "Authorization code exchanged"
        );

        Ok(token_response.into_grant(None))
    }

    /// Refresh the access token.
    ///
    /// A 4xx answer (typically `invalid_grant`) means the refresh token is
    /// no longer accepted and yields [`AuthError::Revoked`]. 5xx answers are
    /// retried up to three attempts with doubling delays from 100ms. Transport
    /// failures yield [`AuthError::NetworkError`].
    ///
    /// When the server omits a new refresh token the old one is kept.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(ref client_secret) = self.config.client_secret {
            params.push(("client_secret", client_secret.as_str()));
        }

        let encoded = serde_urlencoded::to_string(&params)
            .map_err(|e| AuthError::Other(format!("Failed to encode token request: {}", e)))?;

        let mut attempts = 0;
        loop {
            attempts += 1;

            let response = self.post_token_request(encoded.clone()).await.map_err(|e| {
                warn!(error = %e, "Token endpoint unreachable");
                AuthError::NetworkError(e.to_string())
            })?;

            if response.is_success() {
                let token_response: TokenResponse = response.json().map_err(|e| {
                    AuthError::TokenRefreshFailed(format!("Failed to parse token response: {}", e))
                })?;

                info!(
                    expires_in = token_response.expires_in,
                    "Access token refreshed"
                );
                return Ok(token_response.into_grant(Some(refresh_token)));
            }

            let status = response.status;
            let error = TokenErrorResponse::describe(&response);

            if response.is_client_error() {
                warn!(status, error = %error, "Refresh token rejected");
                return Err(AuthError::Revoked(error));
            }

            if attempts >= MAX_REFRESH_ATTEMPTS {
                return Err(AuthError::TokenRefreshFailed(format!(
                    "Token refresh failed after {} attempts. Last error: {} - {}",
                    attempts, status, error
                )));
            }

            let delay = Duration::from_millis(100 * 2u64.pow(attempts - 1));
            warn!(
                status,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Token refresh failed, retrying"
            );
            sleep(delay).await;
        }
    }

    async fn post_token_request(
        &self,
        encoded: String,
    ) -> bridge_traits::error::Result<HttpResponse> {
        let request = HttpRequest::new(HttpMethod::Post, self.config.token_url.clone())
            .header("Accept", "application/json")
            .form(encoded)
            .timeout(self.request_timeout);

        self.http_client
            .execute_with_retry(request, RetryPolicy::no_retry())
            .await
    }
}

/// Successful token endpoint answer.
#[derive(Debug, Deserialize, Serialize)]
struct TokenResponse {
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_grant(self, previous_refresh_token: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh_token.map(str::to_string)),
            expires_in: self.expires_in,
        }
    }
}

fn default_expires_in() -> i64 {
    3600
}

/// Error body of the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenErrorResponse {
    fn describe(response: &HttpResponse) -> String {
        match response.json::<TokenErrorResponse>() {
            Ok(body) => match body.error_description {
                Some(description) => format!("{}: {}", body.error, description),
                None => body.error,
            },
            Err(_) => format!("HTTP {}", response.status),
        }
    }
}
