use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use docseek_graph::FileResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStage {
    #[default]
    Start,
    AwaitingQuery,
    AwaitingSelection,
}

/// Per user-agent conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub account_id: String,
    pub user_email: String,
    pub chat_id: String,
    pub stage: ConversationStage,
    pub last_query: Option<String>,
    /// Candidates offered for selection; only meaningful in `AwaitingSelection`.
    pub found_files: Vec<FileResult>,
}

pub fn new_chat_id() -> String {
    Utc::now().timestamp().to_string()
}

impl Session {
    pub fn new(account_id: impl Into<String>, user_email: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            user_email: user_email.into(),
            chat_id: new_chat_id(),
            stage: ConversationStage::Start,
            last_query: None,
            found_files: Vec::new(),
        }
    }

    /// Back to the greeting, keeping the chat.
    pub fn reset_conversation(&mut self) {
        self.stage = ConversationStage::Start;
        self.found_files.clear();
    }

    pub fn start_new_chat(&mut self) {
        self.chat_id = new_chat_id();
        self.last_query = None;
        self.reset_conversation();
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;
    async fn put(&self, session_id: &str, session: Session) -> Result<()>;
    async fn remove(&self, session_id: &str) -> Result<Option<Session>>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn put(&self, session_id: &str, session: Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session);
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.write().await.remove(session_id))
    }
}
