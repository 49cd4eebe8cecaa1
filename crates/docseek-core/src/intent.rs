//! Intent classification for incoming chat text.
//!
//! The stage machine only needs two answers from the language model: what
//! the user wants (and, for file searches, what to search for), and a reply
//! to small talk. [`OpenAiIntentResolver`] gets both from an
//! OpenAI-compatible `/chat/completions` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    GeneralResponse,
    FileSearch,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentResult {
    pub intent: Intent,
    /// Search text extracted for `FileSearch`.
    pub query: Option<String>,
}

impl IntentResult {
    pub fn unknown() -> Self {
        Self {
            intent: Intent::Unknown,
            query: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("API key not set (expected in ${0})")]
    MissingApiKey(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn classify(&self, text: &str) -> Result<IntentResult, IntentError>;
    async fn answer_general(&self, text: &str) -> Result<String, IntentError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub api_base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

const CLASSIFY_PROMPT: &str = "You route messages for an assistant that finds files in the \
user's OneDrive and SharePoint. Reply with a JSON object only: \
{\"intent\": \"file_search\" | \"general_response\" | \"unknown\", \"data\": string or null}. \
Use file_search when the user wants a document, with data set to the file name or the \
keywords to search for. Use general_response for greetings, thanks and general questions. \
Use unknown otherwise.";

const ANSWER_PROMPT: &str = "You are a friendly workplace assistant that helps people find \
their files. Answer briefly.";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct RawIntent {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Read the model's classification, tolerating code fences. Anything that
/// does not parse is `Unknown`.
pub fn parse_classification(content: &str) -> IntentResult {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let Ok(raw) = serde_json::from_str::<RawIntent>(trimmed) else {
        debug!("unparsable intent payload: {}", trimmed);
        return IntentResult::unknown();
    };

    let query = match raw.data {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    };
    let intent = match raw.intent.as_deref().map(str::trim) {
        Some("file_search") => Intent::FileSearch,
        Some("general_response") => Intent::GeneralResponse,
        _ => Intent::Unknown,
    };
    IntentResult { intent, query }
}

pub struct OpenAiIntentResolver {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl OpenAiIntentResolver {
    pub fn from_config(config: &IntentConfig) -> Result<Self, IntentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IntentError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            api_key_env: config.api_key_env.clone(),
        })
    }

    async fn complete(&self, system: &str, user: &str, json_mode: bool) -> Result<String, IntentError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| IntentError::MissingApiKey(self.api_key_env.clone()))?;
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature: 0.0,
            response_format: json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| IntentError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntentError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| IntentError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| IntentError::Parse("no choices in response".to_string()))
    }
}

#[async_trait]
impl IntentResolver for OpenAiIntentResolver {
    async fn classify(&self, text: &str) -> Result<IntentResult, IntentError> {
        let content = self.complete(CLASSIFY_PROMPT, text, true).await?;
        Ok(parse_classification(&content))
    }

    async fn answer_general(&self, text: &str) -> Result<String, IntentError> {
        let content = self.complete(ANSWER_PROMPT, text, false).await?;
        Ok(content.trim().to_string())
    }
}
