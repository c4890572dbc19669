use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Body of a successful `authorization_code` or `refresh_token` grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Where a cached credential stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid,
    /// Inside the refresh window with a usable refresh token
    Refreshable,
    /// Neither usable nor refreshable; interactive login is required
    Expired,
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialStatus::Valid => write!(f, "valid"),
            CredentialStatus::Refreshable => write!(f, "refreshable"),
            CredentialStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Bearer credential with absolute expiry timestamps.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// When the access token was granted; absent in token files written by older versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

// Tokens stay out of logs and panic messages.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

impl Credential {
    /// Build a credential from a grant response received at `now`.
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: now + Duration::seconds(expires_in),
            issued_at: Some(now),
            refresh_expires_at: response
                .refresh_expires_in
                .map(|secs| now + Duration::seconds(secs)),
            token_type: response.token_type,
            scope: response.scope,
        }
    }

    /// Apply a refresh grant. Fields the endpoint leaves out keep their
    /// previous values, the refresh token in particular.
    pub fn refreshed(&self, response: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: now + Duration::seconds(expires_in),
            issued_at: Some(now),
            refresh_expires_at: response
                .refresh_expires_in
                .map(|secs| now + Duration::seconds(secs))
                .or(self.refresh_expires_at),
            token_type: response.token_type.or_else(|| self.token_type.clone()),
            scope: response.scope.or_else(|| self.scope.clone()),
        }
    }

    /// `skew`, capped at half the token's lifetime so a short-lived token is
    /// not already due for refresh the moment it is granted.
    pub fn refresh_window(&self, skew: Duration) -> Duration {
        match self.issued_at {
            Some(issued_at) => skew.min((self.expires_at - issued_at) / 2),
            None => skew,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now < self.expires_at - self.refresh_window(skew)
    }

    pub fn can_refresh_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some() && self.refresh_expires_at.map_or(true, |at| now < at)
    }

    pub fn status_at(&self, now: DateTime<Utc>, skew: Duration) -> CredentialStatus {
        if self.is_valid_at(now, skew) {
            CredentialStatus::Valid
        } else if self.can_refresh_at(now) {
            CredentialStatus::Refreshable
        } else {
            CredentialStatus::Expired
        }
    }

    /// First characters of the access token, for display.
    pub fn token_preview(&self) -> String {
        let prefix: String = self.access_token.chars().take(12).collect();
        format!("{prefix}...")
    }
}
