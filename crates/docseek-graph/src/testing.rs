//! Scripted Graph transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use docseek_auth_bridge::TokenRefresher;

use crate::http::{GraphRequest, GraphResponse, Transport};
use crate::search::RelevanceRanker;
use crate::{FileResult, GraphError};

#[derive(Debug, Clone)]
enum Scripted {
    Respond(GraphResponse),
    Fail(String),
}

/// Replays scripted outcomes per exact URL.
///
/// Outcomes queued for a URL are consumed in order; the last one repeats.
/// Unscripted URLs answer 404.
#[derive(Debug, Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    log: Mutex<Vec<GraphRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: GraphResponse) {
        self.push(url, Scripted::Respond(response));
    }

    pub fn respond_json(&self, url: &str, status: u16, body: serde_json::Value) {
        self.respond(url, GraphResponse::new(status, body.to_string()));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.push(url, Scripted::Fail(message.to_string()));
    }

    fn push(&self, url: &str, outcome: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn requests(&self) -> Vec<GraphRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: &GraphRequest) -> Result<GraphResponse, GraphError> {
        self.log.lock().unwrap().push(request.clone());
        let outcome = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&request.url) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match outcome {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(GraphError::Transport {
                url: request.url.clone(),
                message,
            }),
            None => Ok(GraphResponse::new(404, "")),
        }
    }
}

/// Refresher that always yields the same outcome.
pub struct StaticRefresher {
    token: Option<String>,
}

impl StaticRefresher {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.map(str::to_string),
        }
    }
}

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(&self, _account_id: &str) -> Option<String> {
        self.token.clone()
    }
}

/// Keeps upstream order, truncated to `top_k`.
pub struct KeepOrder;

#[async_trait]
impl RelevanceRanker for KeepOrder {
    async fn rank(&self, _query: &str, mut files: Vec<FileResult>, top_k: usize) -> Vec<FileResult> {
        files.truncate(top_k);
        files
    }
}
