use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use docseek_auth_bridge::{AuthBridge, CredentialCache, FileCacheStore, TokenRefresher};
use docseek_graph::{BearerAuth, FileResult, GraphClient, ReqwestTransport, SemanticRanker};
use docseek_rank::embedder_from_env_or_hash;
use docseek_transcript::{
    ChatSummary, SenderRole, SqliteTranscriptStore, TranscriptMessage, TranscriptStore,
};

use crate::config::DocseekConfig;
use crate::credentials::CredentialProvider;
use crate::intent::{IntentResolver, OpenAiIntentResolver};
use crate::knowledge::{KeywordKnowledge, KnowledgeHandler};
use crate::paths::DocseekPaths;
use crate::reply::{ChatReply, IntentTag};
use crate::session::{new_chat_id, ConversationStage, MemorySessionStore, Session, SessionStore};
use crate::stage::{ChatInput, StageMachine};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRequest {
    pub message: String,
    pub selection_stage: bool,
    pub selected_indices: Option<Vec<i64>>,
    pub chat_id: Option<String>,
}

impl ChatRequest {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    fn input(&self) -> ChatInput {
        match &self.selected_indices {
            Some(indices) if self.selection_stage && !indices.is_empty() => {
                ChatInput::Indices(indices.clone())
            }
            _ => ChatInput::Text(self.message.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginStatus {
    pub logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub is_hr_admin: bool,
}

impl LoginStatus {
    fn logged_out() -> Self {
        Self {
            logged_in: false,
            chat_id: None,
            user_email: None,
            is_hr_admin: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub stage: Option<ConversationStage>,
    pub chat_id: Option<String>,
    pub files: Vec<FileResult>,
}

/// Drives a chat message from session lookup to recorded reply.
pub struct ChatService {
    config: DocseekConfig,
    credentials: Arc<dyn CredentialProvider>,
    graph: Arc<GraphClient>,
    machine: StageMachine,
    knowledge: Arc<dyn KnowledgeHandler>,
    sessions: Arc<dyn SessionStore>,
    transcripts: Arc<dyn TranscriptStore>,
}

impl ChatService {
    pub fn new(
        config: DocseekConfig,
        credentials: Arc<dyn CredentialProvider>,
        graph: Arc<GraphClient>,
        intents: Arc<dyn IntentResolver>,
        knowledge: Arc<dyn KnowledgeHandler>,
        sessions: Arc<dyn SessionStore>,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> Self {
        let machine = StageMachine::new(graph.clone(), intents, config.chat.greeting.clone());
        Self {
            config,
            credentials,
            graph,
            machine,
            knowledge,
            sessions,
            transcripts,
        }
    }

    /// Wire up the production collaborators under `paths`.
    pub async fn init(paths: &DocseekPaths, config: DocseekConfig) -> Result<Self> {
        info!("Initializing docseek...");
        paths.ensure_dirs()?;

        let cache = Arc::new(CredentialCache::new(
            FileCacheStore::new(paths.token_cache_dir.clone()),
            AuthBridge::new(config.auth.oauth_config()),
            config.auth.scopes.clone(),
        ));
        let refresher: Arc<dyn TokenRefresher> = cache.clone();
        let transport = Arc::new(ReqwestTransport::new(config.graph.timeout())?);
        let ranker = Arc::new(SemanticRanker::new(embedder_from_env_or_hash()));
        let graph = Arc::new(GraphClient::new(&config.graph, transport, Some(refresher), ranker));

        let intents = Arc::new(OpenAiIntentResolver::from_config(&config.intent)?);
        let knowledge = Arc::new(KeywordKnowledge::new(&config.knowledge)?);
        let transcripts = Arc::new(
            SqliteTranscriptStore::new(&paths.transcripts_path)
                .await
                .context("Failed to open transcript store")?,
        );

        Ok(Self::new(
            config,
            cache,
            graph,
            intents,
            knowledge,
            Arc::new(MemorySessionStore::new()),
            transcripts,
        ))
    }

    pub fn is_hr_admin(&self, email: &str) -> bool {
        self.config.is_hr_admin(email)
    }

    pub fn begin_login(&self) -> Result<String> {
        self.credentials.authorize_url()
    }

    /// Redeem the authorization code, identify the user and open a session.
    pub async fn complete_login(&self, session_id: &str, code: &str) -> Result<LoginStatus> {
        if code.trim().is_empty() {
            bail!("Authorization failed: missing code");
        }
        let mut token = self
            .credentials
            .redeem_code(code)
            .await
            .context("Authorization failed")?;

        let auth = BearerAuth::new(token.access_token.clone(), None);
        let user = self
            .graph
            .current_user(&auth)
            .await
            .context("Failed to read the signed-in user")?;
        let email = user.email().unwrap_or_default().to_string();

        token.account_id = user.id.clone();
        if !email.is_empty() {
            token.username = Some(email.clone());
        }
        self.credentials.store_login(token)?;

        let session = Session::new(user.id, email);
        self.sessions.put(session_id, session.clone()).await?;
        info!("{} signed in", session.user_email);
        Ok(self.status_of(&session))
    }

    /// Report the login and restart the conversation of the current chat.
    pub async fn check_login(&self, session_id: &str) -> Result<LoginStatus> {
        let Some(mut session) = self.sessions.get(session_id).await? else {
            return Ok(LoginStatus::logged_out());
        };
        if session.user_email.is_empty() {
            return Ok(LoginStatus::logged_out());
        }
        if session.chat_id.is_empty() {
            session.chat_id = new_chat_id();
        }
        session.reset_conversation();
        self.sessions.put(session_id, session.clone()).await?;
        Ok(self.status_of(&session))
    }

    fn status_of(&self, session: &Session) -> LoginStatus {
        LoginStatus {
            logged_in: true,
            chat_id: Some(session.chat_id.clone()),
            user_email: Some(session.user_email.clone()),
            is_hr_admin: self.is_hr_admin(&session.user_email),
        }
    }

    pub async fn new_chat(&self, session_id: &str) -> Result<String> {
        let Some(mut session) = self.sessions.get(session_id).await? else {
            bail!("Unauthorized");
        };
        session.start_new_chat();
        let chat_id = session.chat_id.clone();
        self.sessions.put(session_id, session).await?;
        Ok(chat_id)
    }

    pub async fn session_state(&self, session_id: &str) -> Result<SessionState> {
        Ok(match self.sessions.get(session_id).await? {
            Some(session) => SessionState {
                stage: Some(session.stage),
                chat_id: Some(session.chat_id),
                files: session.found_files,
            },
            None => SessionState {
                stage: None,
                chat_id: None,
                files: Vec::new(),
            },
        })
    }

    pub async fn list_chats(&self, session_id: &str) -> Result<Vec<ChatSummary>> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(Vec::new());
        };
        self.prune_transcripts().await;
        self.transcripts.list_chats(&session.user_email).await
    }

    pub async fn list_messages(&self, session_id: &str, chat_id: &str) -> Result<Vec<TranscriptMessage>> {
        let Some(session) = self.sessions.get(session_id).await? else {
            bail!("Unauthorized");
        };
        self.transcripts.list_messages(&session.user_email, chat_id).await
    }

    /// End the session and drop the cached credentials of its account.
    pub async fn logout(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.sessions.remove(session_id).await? else {
            return Ok(false);
        };
        self.credentials.forget(&session.account_id)?;
        info!("{} signed out", session.user_email);
        Ok(true)
    }

    pub async fn handle_message(&self, session_id: &str, request: ChatRequest) -> ChatReply {
        self.prune_transcripts().await;

        let session = match self.sessions.get(session_id).await {
            Ok(session) => session,
            Err(err) => {
                error!("session lookup failed: {}", err);
                return ChatReply::new("⚠️ Something went wrong", IntentTag::Error);
            }
        };
        let token = match &session {
            Some(session) => self.acquire(&session.account_id).await,
            None => None,
        };
        let (Some(mut session), Some(token)) = (session, token) else {
            self.end_session(session_id).await;
            return ChatReply::session_expired();
        };

        if let Some(chat_id) = request.chat_id.as_deref().filter(|c| !c.is_empty()) {
            session.chat_id = chat_id.to_string();
        }
        if session.user_email.is_empty() || session.chat_id.is_empty() {
            return ChatReply::new("❌ Missing session", IntentTag::Error);
        }

        let text = request.message.trim();
        if !text.is_empty() {
            self.record(&session, SenderRole::User, text).await;
        }

        if let Some(answer) = self.knowledge.try_answer(text) {
            let reply = ChatReply::new(answer, IntentTag::HrAdmin);
            self.record(&session, SenderRole::Assistant, &reply.response).await;
            self.save_session(session_id, session).await;
            return reply;
        }

        let auth = BearerAuth::new(token, Some(session.account_id.clone()));
        let turn = self.machine.handle(&session, request.input(), &auth).await;

        if auth.refresh_failed() {
            warn!("credential refresh failed for {}, ending session", session.user_email);
            self.end_session(session_id).await;
            return ChatReply::session_expired();
        }

        self.record(&session, SenderRole::Assistant, &turn.reply.response).await;
        turn.update.apply(&mut session);
        self.save_session(session_id, session).await;
        turn.reply
    }

    async fn acquire(&self, account_id: &str) -> Option<String> {
        match self.credentials.acquire_silent(account_id).await {
            Ok(token) => token,
            Err(err) => {
                warn!("silent token acquisition failed for {}: {}", account_id, err);
                None
            }
        }
    }

    async fn end_session(&self, session_id: &str) {
        if let Err(err) = self.sessions.remove(session_id).await {
            error!("failed to remove session: {}", err);
        }
    }

    async fn save_session(&self, session_id: &str, session: Session) {
        if let Err(err) = self.sessions.put(session_id, session).await {
            error!("failed to save session: {}", err);
        }
    }

    async fn record(&self, session: &Session, sender: SenderRole, text: &str) {
        if let Err(err) = self
            .transcripts
            .append(&session.user_email, &session.chat_id, sender, text, Utc::now())
            .await
        {
            warn!("failed to record {} message: {}", sender.as_str(), err);
        }
    }

    async fn prune_transcripts(&self) {
        if let Err(err) = self
            .transcripts
            .prune_older_than(self.config.chat.retention_days)
            .await
        {
            warn!("transcript pruning failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use docseek_auth_bridge::AccountToken;
    use docseek_graph::testing::{FakeTransport, KeepOrder, StaticRefresher};
    use docseek_graph::{GraphConfig, GraphResponse, ScopeTag};
    use serde_json::json;

    use crate::intent::{Intent, IntentError, IntentResult};
    use crate::knowledge::KnowledgeEntry;

    const BASE: &str = "https://graph.test/v1.0";
    const USER: &str = "ada@contoso.com";

    struct FakeCredentials {
        token: Mutex<Option<String>>,
        stored: Mutex<Vec<AccountToken>>,
        forgotten: Mutex<Vec<String>>,
    }

    impl FakeCredentials {
        fn new(token: Option<&str>) -> Self {
            Self {
                token: Mutex::new(token.map(str::to_string)),
                stored: Mutex::new(Vec::new()),
                forgotten: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CredentialProvider for FakeCredentials {
        fn authorize_url(&self) -> Result<String> {
            Ok("https://login.test/authorize?client_id=app".to_string())
        }

        async fn redeem_code(&self, _code: &str) -> Result<AccountToken> {
            Ok(AccountToken {
                account_id: String::new(),
                username: None,
                access_token: "login-token".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: None,
                scope: None,
                token_type: Some("Bearer".to_string()),
            })
        }

        fn store_login(&self, token: AccountToken) -> Result<()> {
            self.stored.lock().unwrap().push(token);
            Ok(())
        }

        async fn acquire_silent(&self, _account_id: &str) -> Result<Option<String>> {
            Ok(self.token.lock().unwrap().clone())
        }

        fn forget(&self, account_id: &str) -> Result<()> {
            self.forgotten.lock().unwrap().push(account_id.to_string());
            Ok(())
        }
    }

    /// Classifies everything as a search for the message text itself,
    /// except "hello" which is small talk.
    struct EchoIntents;

    #[async_trait]
    impl IntentResolver for EchoIntents {
        async fn classify(&self, text: &str) -> Result<IntentResult, IntentError> {
            match text {
                "hello" => Ok(IntentResult {
                    intent: Intent::GeneralResponse,
                    query: None,
                }),
                "???" => Err(IntentError::Parse("garbled".to_string())),
                _ => Ok(IntentResult {
                    intent: Intent::FileSearch,
                    query: Some(text.to_string()),
                }),
            }
        }

        async fn answer_general(&self, _text: &str) -> Result<String, IntentError> {
            Ok("Hello! Ask me for a file.".to_string())
        }
    }

    struct Harness {
        service: ChatService,
        transport: Arc<FakeTransport>,
        credentials: Arc<FakeCredentials>,
        sessions: Arc<MemorySessionStore>,
        transcripts: Arc<SqliteTranscriptStore>,
    }

    async fn harness(token: Option<&str>) -> Harness {
        let mut config = DocseekConfig::default();
        config.graph.base_url = BASE.to_string();
        config.hr_admin_emails = vec!["hr@contoso.com".to_string()];
        config.knowledge = vec![KnowledgeEntry {
            keywords: vec!["annual".to_string(), "leave".to_string()],
            answer: "You get 25 days of annual leave.".to_string(),
        }];

        let transport = Arc::new(FakeTransport::new());
        let refresher: Arc<dyn TokenRefresher> = Arc::new(StaticRefresher::new(None));
        let graph = Arc::new(GraphClient::new(
            &config.graph,
            transport.clone(),
            Some(refresher),
            Arc::new(KeepOrder),
        ));
        let credentials = Arc::new(FakeCredentials::new(token));
        let sessions = Arc::new(MemorySessionStore::new());
        let transcripts = Arc::new(SqliteTranscriptStore::in_memory().await.unwrap());
        let knowledge = Arc::new(KeywordKnowledge::new(&config.knowledge).unwrap());

        let service = ChatService::new(
            config,
            credentials.clone(),
            graph,
            Arc::new(EchoIntents),
            knowledge,
            sessions.clone(),
            transcripts.clone(),
        );
        Harness {
            service,
            transport,
            credentials,
            sessions,
            transcripts,
        }
    }

    fn session(stage: ConversationStage, found_files: Vec<FileResult>) -> Session {
        let mut session = Session::new("oid-1", USER);
        session.chat_id = "chat-1".to_string();
        session.stage = stage;
        session.found_files = found_files;
        session
    }

    fn item(id: &str, name: &str) -> serde_json::Value {
        json!({"id": id, "name": name, "webUrl": format!("https://files.test/{id}")})
    }

    fn file(id: &str, name: &str) -> FileResult {
        FileResult {
            id: id.to_string(),
            name: name.to_string(),
            web_url: format!("https://files.test/{id}"),
            scope: ScopeTag::Personal,
            parent_reference: None,
        }
    }

    fn read_grant() -> serde_json::Value {
        json!({"value": [{"roles": ["read"], "grantedTo": {"user": {"email": USER}}}]})
    }

    fn perms_url(id: &str) -> String {
        format!("{BASE}/me/drive/items/{id}/permissions")
    }

    fn send_url() -> String {
        format!("{BASE}/me/sendMail")
    }

    async fn stored(h: &Harness) -> Session {
        h.sessions.get("s1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_exact_match_with_access_is_delivered() {
        let h = harness(Some("token")).await;
        h.sessions.put("s1", session(ConversationStage::AwaitingQuery, vec![])).await.unwrap();
        h.transport.respond_json(
            &format!("{BASE}/me/drive/root/search(q='budget.xlsx')"),
            200,
            json!({"value": [item("f1", "Budget.xlsx"), item("f2", "budget-2022.xlsx")]}),
        );
        h.transport.respond_json(&perms_url("f1"), 200, read_grant());
        h.transport.respond(&send_url(), GraphResponse::new(202, ""));

        let reply = h.service.handle_message("s1", ChatRequest::text("budget.xlsx")).await;

        assert_eq!(reply.intent, IntentTag::FileSearch);
        assert!(reply.response.contains("https://files.test/f1"));
        assert!(!reply.response.contains("could not be sent"));
        assert_eq!(h.transport.count(&send_url()), 1);
        let session = stored(&h).await;
        assert_eq!(session.stage, ConversationStage::AwaitingQuery);
        assert_eq!(session.last_query.as_deref(), Some("budget.xlsx"));
    }

    #[tokio::test]
    async fn test_ambiguous_results_ask_for_selection() {
        let h = harness(Some("token")).await;
        h.sessions.put("s1", session(ConversationStage::AwaitingQuery, vec![])).await.unwrap();
        h.transport.respond_json(
            &format!("{BASE}/me/drive/root/search(q='policy')"),
            200,
            json!({"value": [
                item("p1", "travel policy.pdf"),
                item("p2", "leave policy.docx"),
                item("p3", "policy index.xlsx")
            ]}),
        );

        let reply = h.service.handle_message("s1", ChatRequest::text("policy")).await;

        assert!(reply.pause_gpt);
        assert_eq!(reply.files.as_ref().map(Vec::len), Some(3));
        let session = stored(&h).await;
        assert_eq!(session.stage, ConversationStage::AwaitingSelection);
        assert_eq!(session.found_files.len(), 3);
        assert_eq!(h.transport.count(&send_url()), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_pick_dropped_and_no_access() {
        let h = harness(Some("token")).await;
        h.sessions
            .put(
                "s1",
                session(
                    ConversationStage::AwaitingSelection,
                    vec![file("f1", "a.pdf"), file("f2", "b.pdf")],
                ),
            )
            .await
            .unwrap();

        let reply = h.service.handle_message("s1", ChatRequest::text("1,3")).await;

        assert_eq!(reply.intent, IntentTag::FileSearch);
        assert!(reply.response.contains("No access"));
        assert_eq!(h.transport.count(&perms_url("f1")), 1);
        assert_eq!(h.transport.count_prefix(&format!("{BASE}/me/drive/items/f2")), 0);
        let session = stored(&h).await;
        assert_eq!(session.stage, ConversationStage::AwaitingQuery);
        assert!(session.found_files.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_search_waits_and_retries_once() {
        let transport = Arc::new(FakeTransport::new());
        let url = format!("{BASE}/me/drive/root/search(q='budget')");
        transport.respond(&url, GraphResponse::new(429, "").with_header("Retry-After", "2"));
        transport.respond_json(&url, 200, json!({"value": [item("f1", "budget.xlsx")]}));
        let config = GraphConfig {
            base_url: BASE.to_string(),
            ..GraphConfig::default()
        };
        let graph = GraphClient::new(&config, transport.clone(), None, Arc::new(KeepOrder));

        let started = tokio::time::Instant::now();
        let files = graph
            .search_all_files(&BearerAuth::new("t", Some("oid-1".to_string())), "budget")
            .await;

        assert_eq!(files.len(), 1);
        assert_eq!(transport.count(&url), 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failed_refresh_mid_chat_expires_session() {
        let h = harness(Some("stale")).await;
        h.sessions.put("s1", session(ConversationStage::AwaitingQuery, vec![])).await.unwrap();
        h.transport.respond(
            &format!("{BASE}/me/drive/root/search(q='budget')"),
            GraphResponse::new(401, ""),
        );

        let reply = h.service.handle_message("s1", ChatRequest::text("budget")).await;

        assert_eq!(reply.intent, IntentTag::SessionExpired);
        assert!(h.sessions.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_silent_token_expires_session() {
        let h = harness(None).await;
        h.sessions.put("s1", session(ConversationStage::AwaitingQuery, vec![])).await.unwrap();

        let reply = h.service.handle_message("s1", ChatRequest::text("budget")).await;

        assert_eq!(reply, ChatReply::session_expired());
        assert!(h.sessions.get("s1").await.unwrap().is_none());
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_expired() {
        let h = harness(Some("token")).await;
        let reply = h.service.handle_message("nobody", ChatRequest::text("hi")).await;
        assert_eq!(reply.intent, IntentTag::SessionExpired);
    }

    #[tokio::test]
    async fn test_session_without_email_is_missing() {
        let h = harness(Some("token")).await;
        let mut broken = session(ConversationStage::Start, vec![]);
        broken.user_email.clear();
        h.sessions.put("s1", broken).await.unwrap();

        let reply = h.service.handle_message("s1", ChatRequest::text("hi")).await;
        assert_eq!(reply.intent, IntentTag::Error);
        assert_eq!(reply.response, "❌ Missing session");
    }

    #[tokio::test]
    async fn test_greeting_then_general_answer_and_transcript() {
        let h = harness(Some("token")).await;
        h.sessions.put("s1", session(ConversationStage::Start, vec![])).await.unwrap();

        let greeting = h.service.handle_message("s1", ChatRequest::text("hey")).await;
        assert_eq!(greeting.intent, IntentTag::Greeting);
        assert_eq!(stored(&h).await.stage, ConversationStage::AwaitingQuery);

        let answer = h.service.handle_message("s1", ChatRequest::text("hello")).await;
        assert_eq!(answer.intent, IntentTag::GeneralResponse);
        assert_eq!(answer.response, "Hello! Ask me for a file.");

        let messages = h.transcripts.list_messages(USER, "chat-1").await.unwrap();
        let senders: Vec<SenderRole> = messages.iter().map(|m| m.sender).collect();
        assert_eq!(
            senders,
            vec![SenderRole::User, SenderRole::Assistant, SenderRole::User, SenderRole::Assistant]
        );
        assert_eq!(messages[0].message, "hey");
    }

    #[tokio::test]
    async fn test_knowledge_answer_leaves_stage_alone() {
        let h = harness(Some("token")).await;
        let files = vec![file("f1", "a.pdf"), file("f2", "b.pdf")];
        h.sessions
            .put("s1", session(ConversationStage::AwaitingSelection, files.clone()))
            .await
            .unwrap();

        let reply = h
            .service
            .handle_message("s1", ChatRequest::text("how much annual leave do I have"))
            .await;

        assert_eq!(reply.intent, IntentTag::HrAdmin);
        let session = stored(&h).await;
        assert_eq!(session.stage, ConversationStage::AwaitingSelection);
        assert_eq!(session.found_files, files);
    }

    #[tokio::test]
    async fn test_unclassifiable_text_asks_to_rephrase() {
        let h = harness(Some("token")).await;
        h.sessions.put("s1", session(ConversationStage::AwaitingQuery, vec![])).await.unwrap();
        let reply = h.service.handle_message("s1", ChatRequest::text("???")).await;
        assert_eq!(reply.intent, IntentTag::Error);
        assert!(reply.response.contains("rephrase"));
    }

    #[tokio::test]
    async fn test_no_results_anywhere() {
        let h = harness(Some("token")).await;
        h.sessions.put("s1", session(ConversationStage::AwaitingQuery, vec![])).await.unwrap();
        let reply = h.service.handle_message("s1", ChatRequest::text("ghost.txt")).await;
        assert_eq!(reply.response, "📁 No files found.");
        assert_eq!(h.transport.count(&format!("{BASE}/me/drive/recent")), 1);
    }

    #[tokio::test]
    async fn test_structured_selection_delivers_accessible_files() {
        let h = harness(Some("token")).await;
        h.sessions
            .put(
                "s1",
                session(
                    ConversationStage::AwaitingQuery,
                    vec![file("f1", "a.pdf"), file("f2", "b.pdf"), file("f3", "c.pdf")],
                ),
            )
            .await
            .unwrap();
        h.transport.respond_json(&perms_url("f1"), 200, read_grant());
        h.transport.respond_json(&perms_url("f3"), 200, read_grant());
        h.transport.respond(&send_url(), GraphResponse::new(202, ""));

        let request = ChatRequest {
            selection_stage: true,
            selected_indices: Some(vec![3, 1, 3]),
            ..ChatRequest::default()
        };
        let reply = h.service.handle_message("s1", request).await;

        assert_eq!(reply.intent, IntentTag::FileSearch);
        assert_eq!(
            reply.response,
            "✅ Sent:\nc.pdf: https://files.test/f3\na.pdf: https://files.test/f1"
        );
        assert_eq!(h.transport.count(&send_url()), 1);
        assert_eq!(stored(&h).await.stage, ConversationStage::AwaitingQuery);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported() {
        let h = harness(Some("token")).await;
        h.sessions
            .put("s1", session(ConversationStage::AwaitingSelection, vec![file("f1", "a.pdf")]))
            .await
            .unwrap();
        h.transport.respond_json(&perms_url("f1"), 200, read_grant());
        h.transport.respond(&send_url(), GraphResponse::new(500, "mailbox unavailable"));

        let reply = h.service.handle_message("s1", ChatRequest::text("1")).await;

        assert!(reply.response.starts_with("✅ Sent:\na.pdf"));
        assert!(reply.response.contains("could not be sent"));
    }

    #[tokio::test]
    async fn test_invalid_selection_keeps_waiting() {
        let h = harness(Some("token")).await;
        let files = vec![file("f1", "a.pdf")];
        h.sessions
            .put("s1", session(ConversationStage::AwaitingSelection, files.clone()))
            .await
            .unwrap();

        let reply = h.service.handle_message("s1", ChatRequest::text("7")).await;

        assert_eq!(reply.response, "❌ Invalid selection");
        let session = stored(&h).await;
        assert_eq!(session.stage, ConversationStage::AwaitingSelection);
        assert_eq!(session.found_files, files);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_expired_list_return_to_query() {
        let h = harness(Some("token")).await;
        h.sessions
            .put("s1", session(ConversationStage::AwaitingSelection, vec![file("f1", "a.pdf")]))
            .await
            .unwrap();
        let reply = h.service.handle_message("s1", ChatRequest::text(" CANCEL ")).await;
        assert_eq!(reply.response, "❌ Cancelled");
        assert_eq!(reply.intent, IntentTag::GeneralResponse);
        let current = stored(&h).await;
        assert_eq!(current.stage, ConversationStage::AwaitingQuery);
        assert!(current.found_files.is_empty());

        h.sessions
            .put("s1", session(ConversationStage::AwaitingSelection, vec![]))
            .await
            .unwrap();
        let reply = h.service.handle_message("s1", ChatRequest::text("1")).await;
        assert_eq!(reply.response, "⚠️ File list expired");
        assert_eq!(stored(&h).await.stage, ConversationStage::AwaitingQuery);
    }

    #[tokio::test]
    async fn test_login_lifecycle() {
        let h = harness(Some("token")).await;
        h.transport.respond_json(
            &format!("{BASE}/me"),
            200,
            json!({"id": "oid-9", "mail": null, "userPrincipalName": "hr@contoso.com"}),
        );

        assert!(h.service.begin_login().unwrap().starts_with("https://login.test/"));

        let status = h.service.complete_login("s9", "auth-code").await.unwrap();
        assert!(status.logged_in);
        assert!(status.is_hr_admin);
        assert_eq!(status.user_email.as_deref(), Some("hr@contoso.com"));
        {
            let stored = h.credentials.stored.lock().unwrap();
            assert_eq!(stored[0].account_id, "oid-9");
            assert_eq!(stored[0].username.as_deref(), Some("hr@contoso.com"));
        }

        let greeting = h.service.handle_message("s9", ChatRequest::text("hi")).await;
        assert_eq!(greeting.intent, IntentTag::Greeting);

        let old_chat = status.chat_id.unwrap();
        let status = h.service.check_login("s9").await.unwrap();
        assert_eq!(status.chat_id.as_deref(), Some(old_chat.as_str()));
        let state = h.service.session_state("s9").await.unwrap();
        assert_eq!(state.stage, Some(ConversationStage::Start));

        let chats = h.service.list_chats("s9").await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].title.as_deref(), Some("hi"));
        let messages = h.service.list_messages("s9", &old_chat).await.unwrap();
        assert_eq!(messages.len(), 2);

        h.service.new_chat("s9").await.unwrap();
        assert_eq!(
            h.service.session_state("s9").await.unwrap().stage,
            Some(ConversationStage::Start)
        );

        assert!(h.service.logout("s9").await.unwrap());
        assert_eq!(*h.credentials.forgotten.lock().unwrap(), vec!["oid-9".to_string()]);
        assert!(!h.service.check_login("s9").await.unwrap().logged_in);
        assert!(h.service.new_chat("s9").await.is_err());
        assert!(h.service.list_chats("s9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_chat_id_switches_chat() {
        let h = harness(Some("token")).await;
        h.sessions.put("s1", session(ConversationStage::Start, vec![])).await.unwrap();
        let request = ChatRequest {
            message: "hey".to_string(),
            chat_id: Some("chat-2".to_string()),
            ..ChatRequest::default()
        };
        h.service.handle_message("s1", request).await;
        assert_eq!(stored(&h).await.chat_id, "chat-2");
        assert_eq!(h.transcripts.list_messages(USER, "chat-2").await.unwrap().len(), 2);
    }
}
