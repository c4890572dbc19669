use async_trait::async_trait;
use reqwest::Url;

use crate::auth::credential::TokenResponse;
use crate::config::ViyaConfig;
use crate::error::{BenchError, Result};

/// OAuth token grants used by [`CredentialManager`](super::CredentialManager).
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// `authorization_code` grant.
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse>;

    /// `refresh_token` grant.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// Token endpoint of a SAS Logon server.
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    authorize_url: String,
    client_id: String,
    username: String,
    password: String,
    scope: String,
}

impl OAuthClient {
    pub fn new(config: &ViyaConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            token_url: config.token_url(),
            authorize_url: config.authorize_url(),
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            scope: config.scope.clone(),
        })
    }

    /// URL the user opens in a browser to obtain an authorization code.
    pub fn authorization_url(&self) -> Result<String> {
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("scope", self.scope.as_str()),
            ],
        )
        .map_err(|e| BenchError::Config(format!("invalid authorize URL: {e}")))?;
        Ok(url.into())
    }

    async fn grant(&self, grant_type: &'static str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut fields = vec![("grant_type", grant_type), ("client_id", self.client_id.as_str())];
        fields.extend_from_slice(form);

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&fields)
            .send()
            .await
            .map_err(|e| BenchError::Auth(format!("{grant_type} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BenchError::Auth(format!(
                "{grant_type} rejected with HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| BenchError::Auth(format!("malformed {grant_type} response: {e}")))
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        self.grant("authorization_code", &[("code", code)]).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.grant("refresh_token", &[("refresh_token", refresh_token)])
            .await
    }
}
