use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Answers fixed-domain questions before the conversation flow sees them.
pub trait KnowledgeHandler: Send + Sync {
    fn try_answer(&self, text: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub keywords: Vec<String>,
    pub answer: String,
}

pub struct NoKnowledge;

impl KnowledgeHandler for NoKnowledge {
    fn try_answer(&self, _text: &str) -> Option<String> {
        None
    }
}

/// Matches when every keyword of an entry appears as a whole word.
/// The first matching entry wins.
pub struct KeywordKnowledge {
    entries: Vec<(Vec<Regex>, String)>,
}

impl KeywordKnowledge {
    pub fn new(entries: &[KnowledgeEntry]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.keywords.iter().all(|k| k.trim().is_empty()) {
                continue;
            }
            let patterns = entry
                .keywords
                .iter()
                .filter(|k| !k.trim().is_empty())
                .map(|k| {
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k.trim())))
                        .with_context(|| format!("invalid knowledge keyword: {k}"))
                })
                .collect::<Result<Vec<_>>>()?;
            compiled.push((patterns, entry.answer.clone()));
        }
        Ok(Self { entries: compiled })
    }
}

impl KnowledgeHandler for KeywordKnowledge {
    fn try_answer(&self, text: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|(patterns, _)| patterns.iter().all(|re| re.is_match(text)))
            .map(|(_, answer)| answer.clone())
    }
}
