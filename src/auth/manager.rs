use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::auth::credential::{Credential, CredentialStatus};
use crate::auth::endpoint::TokenEndpoint;
use crate::auth::store::TokenStore;
use crate::error::{BenchError, Result};

/// Refresh this long before the access token actually expires.
pub const DEFAULT_REFRESH_SKEW_MINUTES: i64 = 5;

/// Owns the bearer credential shared by every driver task.
///
/// Readers get a cloned token string, never a reference into the cache.
/// Refreshes are serialized through `refresh_gate`: callers that queue up
/// behind an in-flight refresh re-check the cache once they get the gate and
/// reuse the token that refresh produced.
pub struct CredentialManager {
    endpoint: Arc<dyn TokenEndpoint>,
    store: Option<TokenStore>,
    skew: Duration,
    credential: RwLock<Option<Credential>>,
    refresh_gate: Mutex<()>,
}

impl CredentialManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            endpoint,
            store: None,
            skew: Duration::minutes(DEFAULT_REFRESH_SKEW_MINUTES),
            credential: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Seed the cache from the token store. Returns whether a credential was found.
    pub async fn load(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let loaded = store.load().await?;
        let found = loaded.is_some();
        *self.credential.write().await = loaded;
        Ok(found)
    }

    pub async fn set_credential(&self, credential: Credential) {
        *self.credential.write().await = Some(credential);
    }

    pub async fn snapshot(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }

    /// `None` when no credential is cached.
    pub async fn status(&self) -> Option<CredentialStatus> {
        self.credential
            .read()
            .await
            .as_ref()
            .map(|c| c.status_at(Utc::now(), self.skew))
    }

    pub async fn invalidate(&self) {
        *self.credential.write().await = None;
    }

    /// Exchange an authorization code obtained interactively and persist the result.
    pub async fn authenticate_with_code(&self, code: &str) -> Result<Credential> {
        let _gate = self.refresh_gate.lock().await;
        let response = self.endpoint.exchange_code(code).await?;
        let credential = Credential::from_response(response, Utc::now());
        *self.credential.write().await = Some(credential.clone());
        self.persist(&credential).await?;
        tracing::info!(expires_at = %credential.expires_at, "Authenticated with authorization code");
        Ok(credential)
    }

    /// Return an access token that stays valid for at least the refresh skew,
    /// refreshing it first when needed.
    ///
    /// # Errors
    ///
    /// [`BenchError::Auth`] when nothing is cached, the credential can no longer
    /// be refreshed, or the refresh grant fails. In the last two cases the cache
    /// is cleared and an interactive login is required.
    pub async fn get_valid_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token().await? {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited for the gate.
        if let Some(token) = self.cached_token().await? {
            return Ok(token);
        }

        let current = self.credential.read().await.clone().ok_or_else(not_authenticated)?;
        let now = Utc::now();
        let refresh_token = match current.refresh_token.as_deref() {
            Some(token) if current.can_refresh_at(now) => token.to_string(),
            _ => {
                self.invalidate().await;
                tracing::error!("Access token expired and cannot be refreshed");
                return Err(BenchError::Auth(
                    "access token expired and no usable refresh token, run `auth login`".to_string(),
                ));
            }
        };

        tracing::info!(expires_at = %current.expires_at, "Refreshing access token");
        let response = match self.endpoint.refresh(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                self.invalidate().await;
                tracing::error!(error = %e, "Token refresh failed");
                return Err(match e {
                    BenchError::Auth(_) => e,
                    other => BenchError::Auth(format!("token refresh failed: {other}")),
                });
            }
        };

        let refreshed = current.refreshed(response, Utc::now());
        let token = refreshed.access_token.clone();
        *self.credential.write().await = Some(refreshed.clone());

        // A cached token is still usable for this run even if it cannot be saved.
        if let Err(e) = self.persist(&refreshed).await {
            tracing::warn!(error = %e, "Failed to persist refreshed tokens");
        }
        if refreshed.refresh_window(self.skew) < self.skew {
            tracing::warn!(
                expires_at = %refreshed.expires_at,
                skew_secs = self.skew.num_seconds(),
                "Refreshed token lives shorter than twice the refresh skew, refreshing at half its lifetime"
            );
        }
        tracing::info!(expires_at = %refreshed.expires_at, "Access token refreshed");
        Ok(token)
    }

    /// Fast path: `Some` when the cached token is valid, `None` when a refresh is needed.
    async fn cached_token(&self) -> Result<Option<String>> {
        let guard = self.credential.read().await;
        let credential = guard.as_ref().ok_or_else(not_authenticated)?;
        if credential.is_valid_at(Utc::now(), self.skew) {
            Ok(Some(credential.access_token.clone()))
        } else {
            Ok(None)
        }
    }

    async fn persist(&self, credential: &Credential) -> Result<()> {
        match &self.store {
            Some(store) => store.save(credential).await,
            None => Ok(()),
        }
    }
}

fn not_authenticated() -> BenchError {
    BenchError::Auth("no stored credential, run `auth login` first".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::TokenResponse;
    use async_trait::async_trait;

    struct RejectingEndpoint;

    #[async_trait]
    impl TokenEndpoint for RejectingEndpoint {
        async fn exchange_code(&self, _code: &str) -> Result<TokenResponse> {
            Err(BenchError::Auth("invalid code".into()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
            Err(BenchError::Auth("refresh rejected".into()))
        }
    }

    /// Credential granted an hour ago with `remaining` seconds left.
    fn credential(remaining: i64, refresh: Option<&str>) -> Credential {
        Credential::from_response(
            TokenResponse {
                access_token: "cached".into(),
                refresh_token: refresh.map(String::from),
                expires_in: Some(3600 + remaining),
                refresh_expires_in: None,
                token_type: None,
                scope: None,
            },
            Utc::now() - Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn empty_cache_is_an_auth_error() {
        let manager = CredentialManager::new(Arc::new(RejectingEndpoint));
        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, BenchError::Auth(_)));
        assert!(manager.status().await.is_none());
    }

    #[tokio::test]
    async fn valid_credential_is_served_from_cache() {
        let manager = CredentialManager::new(Arc::new(RejectingEndpoint));
        manager.set_credential(credential(3600, Some("r"))).await;
        assert_eq!(manager.get_valid_token().await.unwrap(), "cached");
        assert_eq!(manager.status().await, Some(CredentialStatus::Valid));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_invalidates() {
        let manager = CredentialManager::new(Arc::new(RejectingEndpoint));
        manager.set_credential(credential(10, None)).await;

        assert!(matches!(
            manager.get_valid_token().await,
            Err(BenchError::Auth(_))
        ));
        assert!(manager.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn load_without_store_finds_nothing() {
        let manager = CredentialManager::new(Arc::new(RejectingEndpoint));
        assert!(!manager.load().await.unwrap());
    }
}
