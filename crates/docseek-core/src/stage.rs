//! The conversation flow: greeting, query intake, candidate selection and
//! delivery.
//!
//! [`StageMachine::handle`] reads the session and returns the reply together
//! with the new conversation state; it never writes the session itself.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use docseek_graph::{BearerAuth, FileResult, GraphClient};

use crate::intent::{Intent, IntentResolver, IntentResult};
use crate::reply::{ChatReply, IntentTag};
use crate::session::{ConversationStage, Session};

const DELIVERY_FAILED: &str = "⚠️ The email could not be sent, but the links above still work.";

/// One incoming chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Text(String),
    /// 1-based indices picked from the offered candidates.
    Indices(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub stage: ConversationStage,
    pub last_query: Option<String>,
    pub found_files: Vec<FileResult>,
}

impl SessionUpdate {
    pub fn apply(self, session: &mut Session) {
        session.stage = self.stage;
        session.last_query = self.last_query;
        session.found_files = self.found_files;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub reply: ChatReply,
    pub update: SessionUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selection {
    Cancel,
    Indices(Vec<i64>),
}

fn parse_selection(text: &str) -> Selection {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("cancel") {
        return Selection::Cancel;
    }
    Selection::Indices(
        trimmed
            .split(',')
            .filter_map(|part| {
                let part = part.trim();
                if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                    part.parse().ok()
                } else {
                    None
                }
            })
            .collect(),
    )
}

/// Map 1-based picks onto `len` candidates: out-of-range picks are dropped,
/// repeats collapse onto their first occurrence.
pub fn resolve_indices(picks: &[i64], len: usize) -> Vec<usize> {
    let mut seen = HashSet::new();
    picks
        .iter()
        .filter(|&&pick| pick >= 1 && (pick as u64) <= len as u64)
        .map(|&pick| (pick - 1) as usize)
        .filter(|idx| seen.insert(*idx))
        .collect()
}

pub struct StageMachine {
    graph: Arc<GraphClient>,
    intents: Arc<dyn IntentResolver>,
    greeting: String,
}

impl StageMachine {
    pub fn new(graph: Arc<GraphClient>, intents: Arc<dyn IntentResolver>, greeting: impl Into<String>) -> Self {
        Self {
            graph,
            intents,
            greeting: greeting.into(),
        }
    }

    pub async fn handle(&self, session: &Session, input: ChatInput, auth: &BearerAuth) -> Turn {
        match input {
            ChatInput::Indices(picks) => self.select(session, Selection::Indices(picks), auth).await,
            ChatInput::Text(text) => match session.stage {
                ConversationStage::Start => Turn {
                    reply: ChatReply::new(self.greeting.clone(), IntentTag::Greeting),
                    update: awaiting_query(session.last_query.clone()),
                },
                ConversationStage::AwaitingQuery => self.query(session, &text, auth).await,
                ConversationStage::AwaitingSelection => {
                    self.select(session, parse_selection(&text), auth).await
                }
            },
        }
    }

    async fn query(&self, session: &Session, text: &str, auth: &BearerAuth) -> Turn {
        let classified = match self.intents.classify(text).await {
            Ok(result) => result,
            Err(err) => {
                warn!("intent classification failed: {}", err);
                IntentResult::unknown()
            }
        };

        match (classified.intent, classified.query) {
            (Intent::GeneralResponse, _) => {
                let answer = match self.intents.answer_general(text).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!("general answer failed: {}", err);
                        "⚠️ Sorry, I can’t answer that right now.".to_string()
                    }
                };
                Turn {
                    reply: ChatReply::new(answer, IntentTag::GeneralResponse),
                    update: awaiting_query(session.last_query.clone()),
                }
            }
            (Intent::FileSearch, Some(query)) if !query.is_empty() => {
                self.search(session, query, auth).await
            }
            _ => Turn {
                reply: ChatReply::new("⚠️ I couldn’t understand. Please rephrase.", IntentTag::Error),
                update: awaiting_query(session.last_query.clone()),
            },
        }
    }

    async fn search(&self, session: &Session, query: String, auth: &BearerAuth) -> Turn {
        let files = self.graph.search_all_files(auth, &query).await;
        info!("search for {:?} produced {} candidates", query, files.len());

        if files.is_empty() {
            return Turn {
                reply: ChatReply::new("📁 No files found.", IntentTag::FileSearch),
                update: awaiting_query(Some(query)),
            };
        }

        let mut exact = files.iter().filter(|f| f.name.eq_ignore_ascii_case(&query));
        if let (Some(file), None) = (exact.next(), exact.next()) {
            let file = file.clone();
            let reply = if self
                .graph
                .has_access(auth, &file.id, &session.user_email, &file.scope)
                .await
            {
                let mut text = format!("✅ You have access: {}", file.web_url);
                if !self
                    .graph
                    .notify(auth, &session.user_email, std::slice::from_ref(&file))
                    .await
                {
                    text.push('\n');
                    text.push_str(DELIVERY_FAILED);
                }
                ChatReply::new(text, IntentTag::FileSearch)
            } else {
                ChatReply::new("❌ You don’t have access.", IntentTag::FileSearch)
            };
            return Turn {
                reply,
                update: awaiting_query(Some(query)),
            };
        }

        Turn {
            reply: ChatReply::selection(files.clone()),
            update: SessionUpdate {
                stage: ConversationStage::AwaitingSelection,
                last_query: Some(query),
                found_files: files,
            },
        }
    }

    async fn select(&self, session: &Session, selection: Selection, auth: &BearerAuth) -> Turn {
        let files = &session.found_files;
        if files.is_empty() {
            return Turn {
                reply: ChatReply::new("⚠️ File list expired", IntentTag::Error),
                update: awaiting_query(session.last_query.clone()),
            };
        }

        let picks = match selection {
            Selection::Cancel => {
                return Turn {
                    reply: ChatReply::new("❌ Cancelled", IntentTag::GeneralResponse),
                    update: awaiting_query(session.last_query.clone()),
                }
            }
            Selection::Indices(picks) => picks,
        };

        let chosen = resolve_indices(&picks, files.len());
        if chosen.is_empty() {
            return Turn {
                reply: ChatReply::new("❌ Invalid selection", IntentTag::Error),
                update: SessionUpdate {
                    stage: ConversationStage::AwaitingSelection,
                    last_query: session.last_query.clone(),
                    found_files: files.clone(),
                },
            };
        }

        let mut accessible = Vec::new();
        for idx in chosen {
            let file = &files[idx];
            if self
                .graph
                .has_access(auth, &file.id, &session.user_email, &file.scope)
                .await
            {
                accessible.push(file.clone());
            }
        }

        if accessible.is_empty() {
            return Turn {
                reply: ChatReply::new("❌ No access", IntentTag::FileSearch),
                update: awaiting_query(session.last_query.clone()),
            };
        }

        let delivered = self.graph.notify(auth, &session.user_email, &accessible).await;
        let links: Vec<String> = accessible
            .iter()
            .map(|f| format!("{}: {}", f.name, f.web_url))
            .collect();
        let mut text = format!("✅ Sent:\n{}", links.join("\n"));
        if !delivered {
            text.push('\n');
            text.push_str(DELIVERY_FAILED);
        }
        Turn {
            reply: ChatReply::new(text, IntentTag::FileSearch),
            update: awaiting_query(session.last_query.clone()),
        }
    }
}

fn awaiting_query(last_query: Option<String>) -> SessionUpdate {
    SessionUpdate {
        stage: ConversationStage::AwaitingQuery,
        last_query,
        found_files: Vec::new(),
    }
}
