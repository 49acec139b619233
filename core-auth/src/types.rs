use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds before `expires_at` at which an access token is treated as expired.
pub const REFRESH_BUFFER_SECS: i64 = 300;

/// OAuth credential for the photo library.
///
/// # Security
///
/// The `Debug` implementation redacts both tokens; never log the fields
/// directly.
///
/// # Examples
///
/// ```
/// use core_auth::Credential;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let credential = Credential::new("ya29.a0", Some("1//0g".to_string()), now + Duration::hours(1));
/// assert!(!credential.is_expired_at(now));
/// assert!(credential.is_expired_at(now + Duration::minutes(56)));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    /// Absent only when the provider never issued one; refresh is then impossible.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// Build from a token response's `expires_in`.
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(access_token, refresh_token, now + Duration::seconds(expires_in))
    }

    /// True when `now` is within [`REFRESH_BUFFER_SECS`] of expiry or past it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_expired_with_buffer(now, REFRESH_BUFFER_SECS)
    }

    pub fn is_expired_with_buffer(&self, now: DateTime<Utc>, buffer_seconds: i64) -> bool {
        now >= self.expires_at - Duration::seconds(buffer_seconds)
    }

    /// Time remaining until hard expiry, `None` once expired.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            Some(self.expires_at - now)
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Observable credential state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CredentialState {
    /// No credential is stored
    #[default]
    Missing,
    /// Access token usable
    Valid,
    /// Access token inside the refresh buffer or past expiry
    Expired,
    /// Refresh token rejected; a new authorization is required
    Revoked,
}

impl CredentialState {
    pub fn needs_authorization(&self) -> bool {
        matches!(self, CredentialState::Missing | CredentialState::Revoked)
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialState::Missing => write!(f, "Missing"),
            CredentialState::Valid => write!(f, "Valid"),
            CredentialState::Expired => write!(f, "Expired"),
            CredentialState::Revoked => write!(f, "Revoked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_fresh_credential_is_valid() {
        let credential = Credential::from_expires_in("a", Some("r".to_string()), 3600, now());
        assert!(!credential.is_expired_at(now()));
        assert_eq!(
            credential.time_until_expiry(now()),
            Some(Duration::seconds(3600))
        );
    }

    #[test]
    fn test_expired_inside_buffer() {
        let credential = Credential::from_expires_in("a", None, 200, now());
        assert!(credential.is_expired_at(now()));
        assert!(!credential.is_expired_with_buffer(now(), 60));
    }

    #[test]
    fn test_expired_past() {
        let credential = Credential::new("a", None, now() - Duration::hours(1));
        assert!(credential.is_expired_at(now()));
        assert!(credential.time_until_expiry(now()).is_none());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = Credential::new(
            "secret_access_token",
            Some("secret_refresh_token".to_string()),
            now(),
        );
        let debug_str = format!("{:?}", credential);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_access_token"));
        assert!(!debug_str.contains("secret_refresh_token"));
    }

    #[test]
    fn test_serialization_keeps_expiry() {
        let credential = Credential::new("a", Some("r".to_string()), now());
        let json = serde_json::to_string(&credential).unwrap();
        let back: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(back, credential);
    }

    #[test]
    fn test_state_needs_authorization() {
        assert!(CredentialState::Missing.needs_authorization());
        assert!(CredentialState::Revoked.needs_authorization());
        assert!(!CredentialState::Expired.needs_authorization());
        assert!(!CredentialState::Valid.needs_authorization());
        assert_eq!(CredentialState::default(), CredentialState::Missing);
    }
}
