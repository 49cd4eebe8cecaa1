//! Conversation core of docseek: configuration, sessions, the stage machine
//! and the chat service that ties them to Graph and the transcript store.

pub mod chat;
pub mod config;
pub mod credentials;
pub mod intent;
pub mod knowledge;
pub mod paths;
pub mod reply;
pub mod session;
pub mod stage;

pub use chat::{ChatRequest, ChatService, LoginStatus, SessionState};
pub use config::{AuthSection, ChatConfig, DocseekConfig};
pub use credentials::CredentialProvider;
pub use intent::{Intent, IntentConfig, IntentError, IntentResolver, IntentResult, OpenAiIntentResolver};
pub use knowledge::{KeywordKnowledge, KnowledgeEntry, KnowledgeHandler, NoKnowledge};
pub use paths::DocseekPaths;
pub use reply::{ChatReply, IntentTag};
pub use session::{ConversationStage, MemorySessionStore, Session, SessionStore};
pub use stage::{ChatInput, SessionUpdate, StageMachine, Turn};
