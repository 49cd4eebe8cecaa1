use serde::{Deserialize, Serialize};

use docseek_graph::FileResult;

/// What the chat client should make of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentTag {
    Greeting,
    GeneralResponse,
    FileSearch,
    HrAdmin,
    SessionExpired,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub intent: IntentTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileResult>>,
    /// Set while the client should collect a file selection instead of text.
    #[serde(rename = "pauseGPT", default, skip_serializing_if = "std::ops::Not::not")]
    pub pause_gpt: bool,
}

impl ChatReply {
    pub fn new(response: impl Into<String>, intent: IntentTag) -> Self {
        Self {
            response: response.into(),
            intent,
            files: None,
            pause_gpt: false,
        }
    }

    pub fn selection(files: Vec<FileResult>) -> Self {
        Self {
            response: "Select file (e.g., 1,3):".to_string(),
            intent: IntentTag::FileSearch,
            files: Some(files),
            pause_gpt: true,
        }
    }

    pub fn session_expired() -> Self {
        Self::new("❌ Session expired. Please log in again.", IntentTag::SessionExpired)
    }
}
