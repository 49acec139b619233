//! # Credential Store
//!
//! Owns the single photo-library credential: loading it from secure
//! storage, answering "is it usable", refreshing it, and running the
//! authorization code flow for a fresh grant.
//!
//! ## Refresh discipline
//!
//! [`TokenSource::access_token`] never talks to the network. A token inside
//! the five-minute buffer is reported as [`AuthError::Expired`] and the
//! caller decides when to call [`TokenSource::refresh`]. Refreshes are
//! single-flight: concurrent callers queue on one lock, and a caller that
//! arrives within ten seconds of a successful refresh reuses its result
//! instead of hitting the token endpoint again.

use crate::error::{AuthError, Result};
use crate::oauth::{OAuthFlowManager, PkceVerifier};
use crate::token_store::TokenStore;
use crate::types::{Credential, CredentialState};
use async_trait::async_trait;
use bridge_traits::time::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// A refresh that succeeded this recently satisfies later refresh requests.
const REFRESH_DEBOUNCE_SECS: i64 = 10;

const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of bearer tokens for catalog requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token.
    ///
    /// Fails with [`AuthError::Expired`] when the token is inside the refresh
    /// buffer, [`AuthError::NotAuthenticated`] when nothing is stored and
    /// [`AuthError::Revoked`] after the server rejected the refresh token.
    async fn access_token(&self) -> Result<String>;

    /// Obtain a new access token. Concurrent calls collapse into one request.
    async fn refresh(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct CachedCredential {
    credential: Option<Credential>,
    revoked: bool,
    loaded: bool,
}

/// Persistent OAuth credential with single-flight refresh.
pub struct CredentialStore {
    token_store: TokenStore,
    flow: OAuthFlowManager,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    cached: RwLock<CachedCredential>,
    /// Guards refreshes; holds the time of the last successful one.
    refresh_lock: Mutex<Option<DateTime<Utc>>>,
    pending_authorization: Mutex<Option<PkceVerifier>>,
    refresh_timeout: Duration,
}

impl CredentialStore {
    pub fn new(
        token_store: TokenStore,
        flow: OAuthFlowManager,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            token_store,
            flow,
            event_bus,
            clock,
            cached: RwLock::new(CachedCredential::default()),
            refresh_lock: Mutex::new(None),
            pending_authorization: Mutex::new(None),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Read the credential from secure storage into memory.
    ///
    /// A corrupted record has already been erased by the token store and is
    /// reported as [`CredentialState::Missing`].
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<CredentialState> {
        let credential = match self.token_store.load().await {
            Ok(credential) => credential,
            Err(AuthError::TokenCorrupted(message)) => {
                self.emit(AuthEvent::AuthError {
                    message: format!("Stored credential discarded: {}", message),
                    recoverable: false,
                });
                None
            }
            Err(e) => return Err(e),
        };

        {
            let mut cached = self.cached.write().await;
            cached.credential = credential;
            cached.revoked = false;
            cached.loaded = true;
        }

        let state = self.state().await;
        info!(state = %state, "Credential loaded");
        Ok(state)
    }

    /// Current state as seen from memory, without network access.
    pub async fn state(&self) -> CredentialState {
        let cached = self.cached.read().await;
        Self::state_of(&cached, self.clock.now())
    }

    /// Expiry of the current access token, if a credential is held.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.cached
            .read()
            .await
            .credential
            .as_ref()
            .map(|c| c.expires_at)
    }

    /// Start a new authorization. Replaces any attempt already in progress.
    #[instrument(skip(self))]
    pub async fn authorization_url(&self) -> Result<String> {
        let (url, verifier) = self.flow.build_auth_url()?;
        *self.pending_authorization.lock().await = Some(verifier);
        info!("Authorization started");
        Ok(url)
    }

    /// Finish the authorization started by [`authorization_url`](Self::authorization_url).
    #[instrument(skip(self, code, state))]
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<()> {
        let verifier = self
            .pending_authorization
            .lock()
            .await
            .take()
            .ok_or(AuthError::NoAuthorizationInProgress)?;

        let grant = match timeout(
            self.refresh_timeout,
            self.flow.exchange_code(code, state, &verifier),
        )
        .await
        {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                error!(error = %e, "Authorization code exchange failed");
                self.emit(AuthEvent::AuthError {
                    message: e.to_string(),
                    recoverable: false,
                });
                return Err(e);
            }
            Err(_) => {
                self.emit(AuthEvent::AuthError {
                    message: "Authorization timeout".to_string(),
                    recoverable: true,
                });
                return Err(AuthError::OperationTimeout {
                    operation: "authorization code exchange".to_string(),
                });
            }
        };

        let credential = Credential::from_expires_in(
            grant.access_token,
            grant.refresh_token,
            grant.expires_in,
            self.clock.now(),
        );
        self.token_store.store(&credential).await?;

        {
            let mut cached = self.cached.write().await;
            cached.credential = Some(credential);
            cached.revoked = false;
            cached.loaded = true;
        }
        *self.refresh_lock.lock().await = Some(self.clock.now());

        self.emit(AuthEvent::Authorized);
        info!("Photo library authorized");
        Ok(())
    }

    /// Erase the credential from memory and secure storage.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        self.token_store.delete().await?;
        {
            let mut cached = self.cached.write().await;
            *cached = CachedCredential {
                loaded: true,
                ..CachedCredential::default()
            };
        }
        *self.pending_authorization.lock().await = None;
        *self.refresh_lock.lock().await = None;

        self.emit(AuthEvent::SignedOut);
        info!("Signed out");
        Ok(())
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if !self.cached.read().await.loaded {
            self.load().await?;
        }
        Ok(())
    }

    fn state_of(cached: &CachedCredential, now: DateTime<Utc>) -> CredentialState {
        match &cached.credential {
            None => CredentialState::Missing,
            Some(_) if cached.revoked => CredentialState::Revoked,
            Some(credential) if credential.is_expired_at(now) => CredentialState::Expired,
            Some(_) => CredentialState::Valid,
        }
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.event_bus.emit(CoreEvent::Auth(event));
    }

    async fn mark_revoked(&self) {
        self.cached.write().await.revoked = true;
    }
}

#[async_trait]
impl TokenSource for CredentialStore {
    async fn access_token(&self) -> Result<String> {
        self.ensure_loaded().await?;
        let cached = self.cached.read().await;
        match Self::state_of(&cached, self.clock.now()) {
            CredentialState::Missing => Err(AuthError::NotAuthenticated),
            CredentialState::Revoked => Err(AuthError::Revoked(
                "refresh token rejected".to_string(),
            )),
            CredentialState::Expired => Err(AuthError::Expired),
            CredentialState::Valid => cached
                .credential
                .as_ref()
                .map(|c| c.access_token.clone())
                .ok_or(AuthError::NotAuthenticated),
        }
    }

    #[instrument(skip(self))]
    async fn refresh(&self) -> Result<()> {
        self.ensure_loaded().await?;
        let mut last_refresh = self.refresh_lock.lock().await;
        let now = self.clock.now();

        let refresh_token = {
            let cached = self.cached.read().await;
            let Some(credential) = cached.credential.as_ref() else {
                return Err(AuthError::NotAuthenticated);
            };
            if cached.revoked {
                return Err(AuthError::Revoked("refresh token rejected".to_string()));
            }

            let recently_refreshed = last_refresh
                .map(|at| now - at < ChronoDuration::seconds(REFRESH_DEBOUNCE_SECS))
                .unwrap_or(false);
            if recently_refreshed && !credential.is_expired_at(now) {
                debug!("Token refreshed moments ago, reusing it");
                return Ok(());
            }

            credential.refresh_token.clone()
        };

        let Some(refresh_token) = refresh_token else {
            warn!("Credential has no refresh token");
            self.mark_revoked().await;
            self.emit(AuthEvent::AuthError {
                message: "No refresh token available".to_string(),
                recoverable: false,
            });
            return Err(AuthError::Revoked("no refresh token".to_string()));
        };

        self.emit(AuthEvent::TokenRefreshing);
        info!("Refreshing access token");

        let grant = match timeout(
            self.refresh_timeout,
            self.flow.refresh_access_token(&refresh_token),
        )
        .await
        {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                let recoverable = !e.requires_reauthorization();
                if !recoverable {
                    self.mark_revoked().await;
                }
                error!(error = %e, recoverable, "Token refresh failed");
                self.emit(AuthEvent::AuthError {
                    message: format!("Token refresh failed: {}", e),
                    recoverable,
                });
                return Err(e);
            }
            Err(_) => {
                error!("Token refresh timed out");
                self.emit(AuthEvent::AuthError {
                    message: "Token refresh timeout".to_string(),
                    recoverable: true,
                });
                return Err(AuthError::OperationTimeout {
                    operation: "token refresh".to_string(),
                });
            }
        };

        let now = self.clock.now();
        let credential = Credential::from_expires_in(
            grant.access_token,
            grant.refresh_token,
            grant.expires_in,
            now,
        );
        self.token_store.store(&credential).await?;

        let expires_at = credential.expires_at.timestamp();
        self.cached.write().await.credential = Some(credential);
        *last_refresh = Some(now);

        self.emit(AuthEvent::TokenRefreshed { expires_at });
        info!(expires_at, "Token refreshed successfully");
        Ok(())
    }
}
