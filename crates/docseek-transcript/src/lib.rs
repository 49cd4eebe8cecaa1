use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Assistant,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::User => "user",
            SenderRole::Assistant => "assistant",
        }
    }
}

impl FromStr for SenderRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(SenderRole::User),
            "assistant" => Ok(SenderRole::Assistant),
            other => Err(anyhow!("unknown sender role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSummary {
    pub chat_id: String,
    /// First thing the user said in the chat.
    pub title: Option<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptMessage {
    pub sender: SenderRole,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only chat history keyed by user and chat id.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append(
        &self,
        user_email: &str,
        chat_id: &str,
        sender: SenderRole,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Chats of one user, most recently active first.
    async fn list_chats(&self, user_email: &str) -> Result<Vec<ChatSummary>>;

    /// Messages of one chat in the order they were recorded.
    async fn list_messages(&self, user_email: &str, chat_id: &str) -> Result<Vec<TranscriptMessage>>;

    /// Drop messages older than `days`; returns how many were removed.
    async fn prune_older_than(&self, days: i64) -> Result<u64>;
}

#[derive(Clone)]
pub struct SqliteTranscriptStore {
    pool: SqlitePool,
}

impl SqliteTranscriptStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self, wal: bool) -> Result<()> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_email TEXT NOT NULL,\
                chat_id TEXT NOT NULL,\
                sender TEXT NOT NULL,\
                message TEXT NOT NULL,\
                created_at INTEGER NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS messages_chat ON messages (user_email, chat_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    #[instrument(skip(self, text))]
    async fn append(
        &self,
        user_email: &str,
        chat_id: &str,
        sender: SenderRole,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (user_email, chat_id, sender, message, created_at) \
            VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(user_email)
        .bind(chat_id)
        .bind(sender.as_str())
        .bind(text)
        .bind(timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_chats(&self, user_email: &str) -> Result<Vec<ChatSummary>> {
        let rows = sqlx::query_as::<_, (String, i64, Option<String>)>(
            "SELECT m.chat_id, MAX(m.created_at) AS last_at, \
                (SELECT f.message FROM messages f \
                 WHERE f.user_email = m.user_email AND f.chat_id = m.chat_id AND f.sender = 'user' \
                 ORDER BY f.created_at, f.id LIMIT 1) AS title \
            FROM messages m \
            WHERE m.user_email = ?1 \
            GROUP BY m.chat_id \
            ORDER BY last_at DESC",
        )
        .bind(user_email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(chat_id, last_at, title)| ChatSummary {
                chat_id,
                title,
                last_activity: from_millis(last_at),
            })
            .collect())
    }

    async fn list_messages(&self, user_email: &str, chat_id: &str) -> Result<Vec<TranscriptMessage>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT sender, message, created_at FROM messages \
            WHERE user_email = ?1 AND chat_id = ?2 \
            ORDER BY created_at, id",
        )
        .bind(user_email)
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(sender, message, created_at)| -> Result<TranscriptMessage> {
                Ok(TranscriptMessage {
                    sender: sender.parse()?,
                    message,
                    timestamp: from_millis(created_at),
                })
            })
            .collect()
    }

    async fn prune_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let result = sqlx::query("DELETE FROM messages WHERE created_at < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!("pruned {} transcript messages older than {} days", removed, days);
        }
        Ok(removed)
    }
}
