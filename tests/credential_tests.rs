
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use test_harness::{credential, spawn_mock, test_viya_config, Counters, MockState, TEST_BASIC_AUTH};
use viya_bench::auth::{
    CredentialManager, CredentialStatus, OAuthClient, TokenEndpoint, TokenResponse, TokenStore,
};
use viya_bench::error::{BenchError, Result};

/// Token endpoint that counts refreshes and answers after a delay.
struct CountingEndpoint {
    refreshes: AtomicUsize,
    delay: Duration,
    fail: bool,
    lifetime_secs: i64,
}

impl CountingEndpoint {
    fn new(delay: Duration) -> Self {
        Self {
            refreshes: AtomicUsize::new(0),
            delay,
            fail: false,
            lifetime_secs: 3600,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }

    fn short_lived(lifetime_secs: i64) -> Self {
        Self {
            lifetime_secs,
            ..Self::new(Duration::ZERO)
        }
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for CountingEndpoint {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        Ok(TokenResponse {
            access_token: format!("from-{code}"),
            refresh_token: Some("refresh-from-code".into()),
            expires_in: Some(3600),
            refresh_expires_in: Some(86_400),
            token_type: Some("bearer".into()),
            scope: Some("openid".into()),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(BenchError::Auth("refresh token revoked".into()));
        }
        assert_eq!(refresh_token, "refresh-0");
        Ok(TokenResponse {
            access_token: format!("refreshed-{n}"),
            refresh_token: None,
            expires_in: Some(self.lifetime_secs),
            refresh_expires_in: None,
            token_type: None,
            scope: None,
        })
    }
}

#[tokio::test]
async fn test_valid_token_is_served_without_refresh() {
    let endpoint = Arc::new(CountingEndpoint::new(Duration::ZERO));
    let manager = CredentialManager::new(endpoint.clone());
    manager
        .set_credential(credential("access-0", 3600, Some("refresh-0")))
        .await;

    for _ in 0..5 {
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-0");
    }
    assert_eq!(endpoint.refreshes(), 0);
}

#[tokio::test]
async fn test_token_inside_skew_is_refreshed() {
    let endpoint = Arc::new(CountingEndpoint::new(Duration::ZERO));
    let manager = CredentialManager::new(endpoint.clone());
    // Four minutes left is inside the five-minute skew
    manager
        .set_credential(credential("access-0", 240, Some("refresh-0")))
        .await;

    assert_eq!(manager.get_valid_token().await.unwrap(), "refreshed-1");
    assert_eq!(endpoint.refreshes(), 1);

    // The refresh response had no refresh token, so the old one is kept
    let snapshot = manager.snapshot().await.unwrap();
    assert_eq!(snapshot.refresh_token.as_deref(), Some("refresh-0"));
    assert_eq!(manager.status().await, Some(CredentialStatus::Valid));
}

#[tokio::test]
async fn test_short_lived_tokens_are_not_refreshed_on_every_call() {
    // Two-minute tokens are shorter than the five-minute skew
    let endpoint = Arc::new(CountingEndpoint::short_lived(120));
    let manager = CredentialManager::new(endpoint.clone());
    manager
        .set_credential(credential("access-0", 60, Some("refresh-0")))
        .await;

    for _ in 0..5 {
        assert_eq!(manager.get_valid_token().await.unwrap(), "refreshed-1");
    }
    assert_eq!(endpoint.refreshes(), 1);
    assert_eq!(manager.status().await, Some(CredentialStatus::Valid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_refresh() {
    let endpoint = Arc::new(CountingEndpoint::new(Duration::from_millis(100)));
    let manager = Arc::new(CredentialManager::new(endpoint.clone()));
    manager
        .set_credential(credential("access-0", 60, Some("refresh-0")))
        .await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move { manager.get_valid_token().await }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "refreshed-1");
    }
    assert_eq!(endpoint.refreshes(), 1);
}

#[tokio::test]
async fn test_refresh_failure_invalidates_cache() {
    let endpoint = Arc::new(CountingEndpoint::failing());
    let manager = CredentialManager::new(endpoint.clone());
    manager
        .set_credential(credential("access-0", 60, Some("refresh-0")))
        .await;

    let err = manager.get_valid_token().await.unwrap_err();
    assert!(matches!(err, BenchError::Auth(_)));
    assert!(err.is_fatal());
    assert!(manager.snapshot().await.is_none());

    // No second refresh attempt once the cache is empty
    assert!(manager.get_valid_token().await.is_err());
    assert_eq!(endpoint.refreshes(), 1);
}

#[tokio::test]
async fn test_refreshed_tokens_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("sas_tokens.json");

    let endpoint = Arc::new(CountingEndpoint::new(Duration::ZERO));
    let manager = CredentialManager::new(endpoint).with_store(TokenStore::new(&path));
    manager
        .set_credential(credential("access-0", 10, Some("refresh-0")))
        .await;
    manager.get_valid_token().await.unwrap();

    let stored = TokenStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "refreshed-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-0"));
}

#[tokio::test]
async fn test_load_seeds_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    TokenStore::new(&path)
        .save(&credential("stored-access", 3600, Some("stored-refresh")))
        .await
        .unwrap();

    let manager = CredentialManager::new(Arc::new(CountingEndpoint::new(Duration::ZERO)))
        .with_store(TokenStore::new(&path));
    assert!(manager.load().await.unwrap());
    assert_eq!(manager.get_valid_token().await.unwrap(), "stored-access");
}

#[tokio::test]
async fn test_authenticate_with_code_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");

    let manager = CredentialManager::new(Arc::new(CountingEndpoint::new(Duration::ZERO)))
        .with_store(TokenStore::new(&path));
    let credential = manager.authenticate_with_code("abcdef123456").await.unwrap();

    assert_eq!(credential.access_token, "from-abcdef123456");
    assert!(credential.refresh_expires_at.is_some());
    let stored = TokenStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(stored, credential);
}

#[tokio::test]
async fn test_oauth_client_refresh_grant_on_the_wire() {
    let state = Arc::new(MockState::default());
    let base_url = spawn_mock(state.clone()).await;
    let client = OAuthClient::new(&test_viya_config(&base_url)).unwrap();

    let response = client.refresh("refresh-xyz").await.unwrap();
    assert_eq!(response.access_token, "access-1");
    assert_eq!(response.expires_in, Some(3600));

    let forms = state.token_forms.lock().unwrap().clone();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0]["grant_type"], "refresh_token");
    assert_eq!(forms[0]["refresh_token"], "refresh-xyz");
    assert_eq!(forms[0]["client_id"], "bench-client");
    assert_eq!(
        state.authorization_headers.lock().unwrap().as_slice(),
        [TEST_BASIC_AUTH.to_string()]
    );
}

#[tokio::test]
async fn test_oauth_client_code_grant_on_the_wire() {
    let state = Arc::new(MockState::default());
    let base_url = spawn_mock(state.clone()).await;
    let client = OAuthClient::new(&test_viya_config(&base_url)).unwrap();

    client.exchange_code("code-1234567890").await.unwrap();

    let forms = state.token_forms.lock().unwrap().clone();
    assert_eq!(forms[0]["grant_type"], "authorization_code");
    assert_eq!(forms[0]["code"], "code-1234567890");
    assert_eq!(Counters::get(&state.counters.token), 1);
}

#[tokio::test]
async fn test_rejected_grant_is_auth_error() {
    let state = Arc::new(MockState::default());
    *state.token_status.lock().unwrap() = 401;
    let base_url = spawn_mock(state.clone()).await;
    let client = OAuthClient::new(&test_viya_config(&base_url)).unwrap();

    let err = client.refresh("stale").await.unwrap_err();
    match err {
        BenchError::Auth(message) => assert!(message.contains("401")),
        other => panic!("expected auth error, got {other:?}"),
    }
}
