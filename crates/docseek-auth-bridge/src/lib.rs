use std::borrow::Cow;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use oauth2::{
    basic::{BasicClient, BasicTokenResponse},
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod cache;

pub use cache::{CacheStore, CredentialCache, FileCacheStore, TokenCache, TokenRefresher};

/// Tokens held for one signed-in account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountToken {
    /// Stable directory object id of the account. Empty until the login is
    /// completed against `/me`.
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl AccountToken {
    /// True while the access token can still be used for at least `skew`.
    pub fn is_fresh(&self, skew: chrono::Duration) -> bool {
        self.expires_at
            .map(|exp| exp - skew > Utc::now())
            .unwrap_or(true)
    }
}

#[derive(Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Identity authority, e.g. `https://login.microsoftonline.com/common`.
    pub authority: String,
    pub redirect_uri: Option<String>,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("authority", &self.authority)
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl OAuthConfig {
    pub fn auth_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority.trim_end_matches('/'))
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct AuthBridge {
    http_client: Client,
    config: OAuthConfig,
}

impl AuthBridge {
    pub fn new(config: OAuthConfig) -> Self {
        let http_client = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http_client, config }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn authorize_url(&self, scopes: &[String]) -> Result<(String, CsrfToken)> {
        let client = build_client(&self.config)?;
        let mut req = client.authorize_url(CsrfToken::new_random);
        for scope in scopes {
            req = req.add_scope(Scope::new(scope.clone()));
        }
        let (url, csrf) = req.url();
        Ok((url.to_string(), csrf))
    }

    pub async fn exchange_code(&self, code: &str, scopes: &[String]) -> Result<AccountToken> {
        let client = build_client(&self.config)?;
        let mut req = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .add_extra_param("scope", scopes.join(" "));
        if let Some(redirect_uri) = &self.config.redirect_uri {
            req = req.set_redirect_uri(Cow::Owned(RedirectUrl::new(redirect_uri.to_string())?));
        }
        let token = req.request_async(&self.http_client).await?;

        info!("exchanged authorization code for access token");
        Ok(account_token_from(&token, None))
    }

    /// Redeem a refresh token. Identity platforms may rotate the refresh
    /// token; when they don't, the previous one is kept.
    pub async fn refresh_token(&self, refresh_token: &str, scopes: &[String]) -> Result<AccountToken> {
        let client = build_client(&self.config)?;
        let refresh = RefreshToken::new(refresh_token.to_string());
        let mut req = client.exchange_refresh_token(&refresh);
        for scope in scopes {
            req = req.add_scope(Scope::new(scope.clone()));
        }
        let token = req.request_async(&self.http_client).await?;
        Ok(account_token_from(&token, Some(refresh_token)))
    }
}

fn account_token_from(token: &BasicTokenResponse, previous_refresh: Option<&str>) -> AccountToken {
    let access_token = token.access_token().secret().to_string();
    let refresh_token = token
        .refresh_token()
        .map(|t| t.secret().to_string())
        .or_else(|| previous_refresh.map(str::to_string));
    let expires_at = token
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);
    let scope = token.scopes().map(|scopes| {
        scopes
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    });
    let token_type = Some(token.token_type().as_ref().to_string());

    AccountToken {
        account_id: String::new(),
        username: None,
        access_token,
        refresh_token,
        expires_at,
        scope,
        token_type,
    }
}

type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn build_client(config: &OAuthConfig) -> Result<ConfiguredClient> {
    let auth_url = AuthUrl::new(config.auth_url())
        .map_err(|_| anyhow!("invalid authority: {}", config.authority))?;
    let token_url = TokenUrl::new(config.token_url())
        .map_err(|_| anyhow!("invalid authority: {}", config.authority))?;
    let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_client_secret(ClientSecret::new(config.client_secret.clone()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url);
    if let Some(redirect_uri) = &config.redirect_uri {
        client = client.set_redirect_uri(RedirectUrl::new(redirect_uri.clone())?);
    }
    Ok(client)
}
