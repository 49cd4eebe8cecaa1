use anyhow::Result;
use async_trait::async_trait;

use docseek_auth_bridge::{AccountToken, CacheStore, CredentialCache};

/// The login and token operations the chat service relies on.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn authorize_url(&self) -> Result<String>;

    /// Redeem an authorization code. The returned token has no account id yet.
    async fn redeem_code(&self, code: &str) -> Result<AccountToken>;

    fn store_login(&self, token: AccountToken) -> Result<()>;

    /// A usable access token without user interaction, renewing if needed.
    async fn acquire_silent(&self, account_id: &str) -> Result<Option<String>>;

    fn forget(&self, account_id: &str) -> Result<()>;
}

#[async_trait]
impl<S: CacheStore> CredentialProvider for CredentialCache<S> {
    fn authorize_url(&self) -> Result<String> {
        let (url, _state) = self.bridge().authorize_url(self.scopes())?;
        Ok(url)
    }

    async fn redeem_code(&self, code: &str) -> Result<AccountToken> {
        self.bridge().exchange_code(code, self.scopes()).await
    }

    fn store_login(&self, token: AccountToken) -> Result<()> {
        CredentialCache::store_login(self, token)
    }

    async fn acquire_silent(&self, account_id: &str) -> Result<Option<String>> {
        self.acquire_token_silent(account_id, false).await
    }

    fn forget(&self, account_id: &str) -> Result<()> {
        CredentialCache::forget(self, account_id)
    }
}
