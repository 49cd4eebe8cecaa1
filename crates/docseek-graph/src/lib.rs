//! Microsoft Graph access for docseek.
//!
//! Every call goes through [`ResilientExecutor`], which owns the retry policy
//! (refresh on 401, back off on 429, retry transport failures). On top of it
//! sit the federated file search, the permission check and the mail sender.

pub mod access;
pub mod executor;
pub mod http;
pub mod models;
pub mod notify;
pub mod search;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use docseek_auth_bridge::TokenRefresher;

pub use access::AccessVerifier;
pub use executor::{ResilientExecutor, RetryPolicy};
pub use http::{BearerAuth, GraphRequest, GraphResponse, ReqwestTransport, Transport};
pub use models::{FileResult, GraphUser, ParentReference, ScopeTag};
pub use notify::Notifier;
pub use search::{RelevanceRanker, SearchAggregator, SemanticRanker};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("transport error on {url}: {message}")]
    Transport { url: String, message: String },
    #[error("gave up on {url} after {attempts} attempts (last status {last_status:?})")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_status: Option<u16>,
        /// Body of the last response received, if any.
        last_body: Option<String>,
        last_error: Option<String>,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16, body: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Append percent-encoded path segments to `base`.
pub fn graph_url(base: &str, segments: &[&str]) -> Result<String, GraphError> {
    let mut url = Url::parse(base).map_err(|err| GraphError::InvalidUrl(format!("{base}: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| GraphError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub default_retry_after_secs: u64,
    pub timeout_secs: u64,
    pub top_k: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            max_retries: 2,
            default_retry_after_secs: 5,
            timeout_secs: 30,
            top_k: 5,
        }
    }
}

impl GraphConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            default_retry_after: Duration::from_secs(self.default_retry_after_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Facade over the Graph components sharing one executor.
pub struct GraphClient {
    executor: Arc<ResilientExecutor>,
    base_url: String,
    search: SearchAggregator,
    access: AccessVerifier,
    notifier: Notifier,
}

impl GraphClient {
    pub fn new(
        config: &GraphConfig,
        transport: Arc<dyn Transport>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        ranker: Arc<dyn RelevanceRanker>,
    ) -> Self {
        let executor = Arc::new(ResilientExecutor::new(
            transport,
            refresher,
            config.retry_policy(),
        ));
        let base_url = config.base_url.clone();
        Self {
            search: SearchAggregator::new(executor.clone(), &base_url, ranker, config.top_k),
            access: AccessVerifier::new(executor.clone(), &base_url),
            notifier: Notifier::new(executor.clone(), &base_url),
            executor,
            base_url,
        }
    }

    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    pub async fn search_all_files(&self, auth: &BearerAuth, query: &str) -> Vec<FileResult> {
        self.search.search_all_files(auth, query).await
    }

    pub async fn has_access(
        &self,
        auth: &BearerAuth,
        file_id: &str,
        user_email: &str,
        scope: &ScopeTag,
    ) -> bool {
        self.access.has_access(auth, file_id, user_email, scope).await
    }

    pub async fn notify(&self, auth: &BearerAuth, to_email: &str, files: &[FileResult]) -> bool {
        self.notifier.notify(auth, to_email, files).await
    }

    /// The signed-in user, as reported by `GET /me`.
    pub async fn current_user(&self, auth: &BearerAuth) -> Result<GraphUser, GraphError> {
        let url = graph_url(&self.base_url, &["me"])?;
        self.executor.get_json(&url, auth).await
    }
}
