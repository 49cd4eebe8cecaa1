//! Per-account token cache with silent renewal.
//!
//! A [`TokenCache`] is the serializable unit persisted by a [`CacheStore`].
//! [`CredentialCache`] ties a store to an [`AuthBridge`] and hands out
//! short-lived access tokens, redeeming refresh tokens when needed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{AccountToken, AuthBridge};

/// Tokens closer than this to expiry are renewed instead of handed out.
const EXPIRY_SKEW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    accounts: BTreeMap<String, AccountToken>,
}

impl TokenCache {
    pub fn list_accounts(&self) -> Vec<&AccountToken> {
        self.accounts.values().collect()
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountToken> {
        self.accounts.get(account_id)
    }

    pub fn insert(&mut self, token: AccountToken) {
        self.accounts.insert(token.account_id.clone(), token);
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Persistence for token caches, keyed by account identity.
pub trait CacheStore: Send + Sync {
    /// Load the cache for an account. A missing cache is an empty one.
    fn load(&self, account_id: &str) -> Result<TokenCache>;
    fn save(&self, account_id: &str, cache: &TokenCache) -> Result<()>;
    fn remove(&self, account_id: &str) -> Result<()>;
}

/// One JSON file per account under a directory.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        let file_name: String = account_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self, account_id: &str) -> Result<TokenCache> {
        let path = self.path_for(account_id);
        if !path.exists() {
            return Ok(TokenCache::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read token cache: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse token cache: {}", path.display()))
    }

    fn save(&self, account_id: &str, cache: &TokenCache) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(account_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(cache)?)?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to write token cache: {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, account_id: &str) -> Result<()> {
        let path = self.path_for(account_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Hook used by request executors to obtain a new token after a 401.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, account_id: &str) -> Option<String>;
}

pub struct CredentialCache<S> {
    store: S,
    bridge: AuthBridge,
    scopes: Vec<String>,
}

impl<S: CacheStore> CredentialCache<S> {
    pub fn new(store: S, bridge: AuthBridge, scopes: Vec<String>) -> Self {
        Self { store, bridge, scopes }
    }

    pub fn bridge(&self) -> &AuthBridge {
        &self.bridge
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Persist the token obtained by a completed login.
    pub fn store_login(&self, token: AccountToken) -> Result<()> {
        let account_id = token.account_id.clone();
        let mut cache = self.store.load(&account_id)?;
        cache.insert(token);
        self.store.save(&account_id, &cache)?;
        info!("stored credentials for account {}", account_id);
        Ok(())
    }

    pub fn forget(&self, account_id: &str) -> Result<()> {
        self.store.remove(account_id)
    }

    /// Return a usable access token for the account without user interaction.
    ///
    /// Uses the first account listed in the cache. A cached token is handed out
    /// as long as it is not about to expire and `force_refresh` is false;
    /// otherwise the refresh token is redeemed and the cache saved. `Ok(None)`
    /// means there is nothing to renew with.
    pub async fn acquire_token_silent(
        &self,
        account_id: &str,
        force_refresh: bool,
    ) -> Result<Option<String>> {
        let mut cache = self.store.load(account_id)?;
        let Some(account) = cache.list_accounts().first().map(|a| (*a).clone()) else {
            return Ok(None);
        };

        if !force_refresh && account.is_fresh(chrono::Duration::minutes(EXPIRY_SKEW_MINUTES)) {
            return Ok(Some(account.access_token));
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            warn!("no refresh token cached for account {}", account.account_id);
            return Ok(None);
        };

        let mut renewed = self.bridge.refresh_token(refresh_token, &self.scopes).await?;
        renewed.account_id = account.account_id.clone();
        renewed.username = account.username.clone();
        let access_token = renewed.access_token.clone();
        cache.insert(renewed);
        self.store.save(account_id, &cache)?;
        info!("renewed access token for account {}", account.account_id);
        Ok(Some(access_token))
    }
}

#[async_trait]
impl<S: CacheStore> TokenRefresher for CredentialCache<S> {
    async fn refresh(&self, account_id: &str) -> Option<String> {
        match self.acquire_token_silent(account_id, true).await {
            Ok(token) => token,
            Err(err) => {
                warn!("token refresh failed for account {}: {}", account_id, err);
                None
            }
        }
    }
}
