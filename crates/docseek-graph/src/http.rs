//! Request/response types and the transport seam.
//!
//! Everything that talks to the Graph API goes through a [`Transport`]; the
//! production one wraps `reqwest`, tests script one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::GraphError;

#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl GraphRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any existing Authorization header.
    pub fn set_bearer(&mut self, token: &str) {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
    }
}

#[derive(Debug, Clone)]
pub struct GraphResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl GraphResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Server-provided backoff hint in whole seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GraphError> {
        serde_json::from_str(&self.body).map_err(|err| GraphError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

/// The credential used for the Graph calls of one chat message.
///
/// The executor reads the token on every attempt and swaps it after a
/// successful refresh, so later calls in the same message reuse the new one.
#[derive(Debug)]
pub struct BearerAuth {
    account_id: Option<String>,
    token: Mutex<String>,
    refresh_failed: AtomicBool,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>, account_id: Option<String>) -> Self {
        Self {
            account_id,
            token: Mutex::new(token.into()),
            refresh_failed: AtomicBool::new(false),
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn token(&self) -> String {
        match self.token.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace_token(&self, token: String) {
        match self.token.lock() {
            Ok(mut current) => *current = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    pub fn mark_refresh_failed(&self) {
        self.refresh_failed.store(true, Ordering::SeqCst);
    }

    /// True once a 401 could not be recovered by renewing the credential.
    pub fn refresh_failed(&self) -> bool {
        self.refresh_failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &GraphRequest) -> Result<GraphResponse, GraphError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, GraphError> {
        let client = reqwest::Client::builder()
            .user_agent("docseek")
            .timeout(timeout)
            .build()
            .map_err(|err| GraphError::Transport {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &GraphRequest) -> Result<GraphResponse, GraphError> {
        let transport_err = |err: reqwest::Error| GraphError::Transport {
            url: request.url.clone(),
            message: err.to_string(),
        };

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_err)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(transport_err)?;
        Ok(GraphResponse {
            status,
            headers,
            body,
        })
    }
}
