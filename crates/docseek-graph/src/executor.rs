//! Retrying request execution: refresh on 401, back off on 429.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use docseek_auth_bridge::TokenRefresher;

use crate::http::{BearerAuth, GraphRequest, GraphResponse, Transport};
use crate::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Wait used when a 429 carries no usable Retry-After.
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            default_retry_after: Duration::from_secs(5),
        }
    }
}

/// The only path from docseek to the Graph API.
pub struct ResilientExecutor {
    transport: Arc<dyn Transport>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    policy: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            refresher,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `request` with the bearer token from `auth`.
    ///
    /// A 401 triggers one credential refresh per attempt when `auth` names an
    /// account; if the refresh fails the 401 response is returned as-is. A 429
    /// waits for the Retry-After hint before the next attempt. Transport
    /// errors are retried. Every other status is handed back untouched.
    /// Refreshes and backoffs share the same attempt budget.
    pub async fn execute(
        &self,
        request: GraphRequest,
        auth: &BearerAuth,
    ) -> Result<GraphResponse, GraphError> {
        let attempts = self.policy.max_retries + 1;
        let mut last_response: Option<GraphResponse> = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut req = request.clone();
            req.set_bearer(&auth.token());

            let response = match self.transport.send(&req).await {
                Ok(response) => response,
                Err(err) => {
                    error!("Request error on {} (attempt {}/{}): {}", request.url, attempt, attempts, err);
                    last_error = Some(err.to_string());
                    continue;
                }
            };

            match response.status {
                401 => {
                    let (Some(account_id), Some(refresher)) = (auth.account_id(), &self.refresher) else {
                        return Ok(response);
                    };
                    warn!("Received 401 Unauthorized from {}. Attempting token refresh...", request.url);
                    match refresher.refresh(account_id).await {
                        Some(token) => {
                            auth.replace_token(token);
                            last_response = Some(response);
                        }
                        None => {
                            warn!("Token refresh failed for account {}", account_id);
                            auth.mark_refresh_failed();
                            return Ok(response);
                        }
                    }
                }
                429 => {
                    let wait = response
                        .retry_after()
                        .unwrap_or(self.policy.default_retry_after);
                    if attempt < attempts {
                        warn!(
                            "Rate limited on {}. Retrying after {:?} (attempt {}/{})",
                            request.url, wait, attempt, attempts
                        );
                        tokio::time::sleep(wait).await;
                    }
                    last_response = Some(response);
                }
                status => {
                    info!("Request to {} returned status {}", request.url, status);
                    return Ok(response);
                }
            }
        }

        error!("Max retries exceeded for {}", request.url);
        Err(GraphError::RetriesExhausted {
            url: request.url,
            attempts,
            last_status: last_response.as_ref().map(|r| r.status),
            last_body: last_response.map(|r| r.body),
            last_error,
        })
    }

    /// GET a JSON document; anything but 200 is an error.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        auth: &BearerAuth,
    ) -> Result<T, GraphError> {
        let response = self.execute(GraphRequest::get(url), auth).await?;
        if response.status != 200 {
            return Err(GraphError::Status {
                url: url.to_string(),
                status: response.status,
                body: response.body,
            });
        }
        response.json(url)
    }
}
