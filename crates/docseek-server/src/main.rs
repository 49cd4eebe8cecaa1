use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

use docseek_core::{ChatRequest, ChatService, DocseekConfig, DocseekPaths};

#[derive(Debug, Parser)]
#[command(name = "docseek-server", about = "Find and mail your OneDrive and SharePoint files from chat")]
struct Args {
    /// Unix socket to listen on (default: <data dir>/docseek.sock).
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Config file (default: <data dir>/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerRequest {
    id: Option<String>,
    method: String,
    /// Identifies the user-agent the request belongs to.
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct ServerResponse {
    id: Option<String>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ServerResponse {
    fn success(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone)]
struct Handler {
    service: Arc<ChatService>,
}

impl Handler {
    fn new(service: Arc<ChatService>) -> Self {
        Self { service }
    }

    async fn handle_line(&self, line: &str) -> ServerResponse {
        match serde_json::from_str::<ServerRequest>(line) {
            Ok(request) => {
                let id = request.id.clone();
                match self.dispatch(request).await {
                    Ok(result) => ServerResponse::success(id, result),
                    Err(err) => ServerResponse::failure(id, err.to_string()),
                }
            }
            Err(err) => ServerResponse::failure(None, format!("invalid request: {}", err)),
        }
    }

    async fn dispatch(&self, request: ServerRequest) -> Result<Value> {
        let service = &self.service;
        if request.method == "login_url" {
            return Ok(json!({ "url": service.begin_login()? }));
        }

        let session = request
            .session
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing session"))?;
        let params = request.params;

        Ok(match request.method.as_str() {
            "complete_login" => {
                let code = params.get("code").and_then(Value::as_str).unwrap_or_default();
                serde_json::to_value(service.complete_login(session, code).await?)?
            }
            "check_login" => serde_json::to_value(service.check_login(session).await?)?,
            "chat" => {
                let chat: ChatRequest = if params.is_null() {
                    ChatRequest::default()
                } else {
                    serde_json::from_value(params)?
                };
                serde_json::to_value(service.handle_message(session, chat).await)?
            }
            "new_chat" => json!({ "chat_id": service.new_chat(session).await? }),
            "session_state" => serde_json::to_value(service.session_state(session).await?)?,
            "list_chats" => serde_json::to_value(service.list_chats(session).await?)?,
            "list_messages" => {
                let chat_id = params
                    .get("chat_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("missing chat_id"))?;
                json!({ "messages": service.list_messages(session, chat_id).await? })
            }
            "logout" => json!({ "logged_out": service.logout(session).await? }),
            other => anyhow::bail!("unknown method: {}", other),
        })
    }
}

/// One JSON request per line in, one JSON response per line out. Requests
/// on a connection are handled in order.
async fn handle_client(stream: UnixStream, handler: Handler) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = handler.handle_line(trimmed).await;
        let payload = serde_json::to_string(&response)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let paths = DocseekPaths::from_env();
    paths.ensure_dirs()?;

    let config_path = args.config.unwrap_or_else(|| paths.config_path.clone());
    let config = DocseekConfig::load(&config_path)?;
    let service = Arc::new(ChatService::init(&paths, config).await?);
    let handler = Handler::new(service);

    let socket_path = args.socket.unwrap_or_else(|| paths.socket_path.clone());
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!("docseek listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, handler).await {
                        error!("client error: {}", err);
                    }
                });
            }
            Err(err) => error!("accept error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use docseek_auth_bridge::AccountToken;
    use docseek_core::{
        CredentialProvider, IntentError, IntentResolver, IntentResult, MemorySessionStore,
        NoKnowledge, Session, SessionStore,
    };
    use docseek_graph::testing::{FakeTransport, KeepOrder};
    use docseek_graph::{GraphClient, GraphConfig};
    use docseek_transcript::SqliteTranscriptStore;

    struct NoCredentials;

    #[async_trait]
    impl CredentialProvider for NoCredentials {
        fn authorize_url(&self) -> Result<String> {
            Ok("https://login.test/authorize".to_string())
        }

        async fn redeem_code(&self, _code: &str) -> Result<AccountToken> {
            anyhow::bail!("invalid_grant")
        }

        fn store_login(&self, _token: AccountToken) -> Result<()> {
            Ok(())
        }

        async fn acquire_silent(&self, _account_id: &str) -> Result<Option<String>> {
            Ok(Some("token".to_string()))
        }

        fn forget(&self, _account_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Silent;

    #[async_trait]
    impl IntentResolver for Silent {
        async fn classify(&self, _text: &str) -> Result<IntentResult, IntentError> {
            Ok(IntentResult::unknown())
        }

        async fn answer_general(&self, _text: &str) -> Result<String, IntentError> {
            Ok(String::new())
        }
    }

    async fn handler() -> (Handler, Arc<MemorySessionStore>) {
        let config = GraphConfig {
            base_url: "https://graph.test/v1.0".to_string(),
            ..GraphConfig::default()
        };
        let graph = Arc::new(GraphClient::new(
            &config,
            Arc::new(FakeTransport::new()),
            None,
            Arc::new(KeepOrder),
        ));
        let sessions = Arc::new(MemorySessionStore::new());
        let service = ChatService::new(
            DocseekConfig::default(),
            Arc::new(NoCredentials),
            graph,
            Arc::new(Silent),
            Arc::new(NoKnowledge),
            sessions.clone(),
            Arc::new(SqliteTranscriptStore::in_memory().await.unwrap()),
        );
        (Handler::new(Arc::new(service)), sessions)
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_requests() {
        let (handler, _) = handler().await;

        let response = handler.handle_line("not json").await;
        assert!(!response.ok);
        assert!(response.error.unwrap().starts_with("invalid request"));

        let response = handler
            .handle_line(r#"{"id": "1", "method": "fly", "session": "s1"}"#)
            .await;
        assert_eq!(response.id.as_deref(), Some("1"));
        assert_eq!(response.error.as_deref(), Some("unknown method: fly"));

        let response = handler.handle_line(r#"{"id": "2", "method": "check_login"}"#).await;
        assert_eq!(response.error.as_deref(), Some("missing session"));
    }

    #[tokio::test]
    async fn test_login_url_needs_no_session() {
        let (handler, _) = handler().await;
        let response = handler.handle_line(r#"{"id": "1", "method": "login_url"}"#).await;
        assert!(response.ok);
        assert_eq!(response.result.unwrap()["url"], "https://login.test/authorize");
    }

    #[tokio::test]
    async fn test_chat_over_socket() {
        let (handler, sessions) = handler().await;
        sessions
            .put("s1", Session::new("oid-1", "ada@contoso.com"))
            .await
            .unwrap();

        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_client(server, handler));

        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer
            .write_all(b"{\"id\":\"1\",\"method\":\"chat\",\"session\":\"s1\",\"params\":{\"message\":\"hi\"}}\n\n")
            .await
            .unwrap();
        writer
            .write_all(b"{\"id\":\"2\",\"method\":\"session_state\",\"session\":\"s1\"}\n")
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["id"], "1");
        assert_eq!(first["ok"], true);
        assert_eq!(first["result"]["intent"], "greeting");

        let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["result"]["stage"], "awaiting_query");

        drop(writer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_login_is_reported() {
        let (handler, _) = handler().await;
        let response = handler
            .handle_line(r#"{"id": "9", "method": "complete_login", "session": "s1", "params": {"code": "abc"}}"#)
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("Authorization failed"));
    }
}
