//! Federated file search across the personal drive and every site drive.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use docseek_rank::{rank_by_similarity, Embedder};

use crate::executor::ResilientExecutor;
use crate::http::BearerAuth;
use crate::models::{Drive, DriveItem, FileResult, Page, ScopeTag, Site};
use crate::graph_url;

/// Reorders search results by relevance and keeps the best `top_k`.
#[async_trait]
pub trait RelevanceRanker: Send + Sync {
    async fn rank(&self, query: &str, files: Vec<FileResult>, top_k: usize) -> Vec<FileResult>;
}

pub struct SemanticRanker {
    embedder: Arc<dyn Embedder>,
}

impl SemanticRanker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl RelevanceRanker for SemanticRanker {
    async fn rank(&self, query: &str, mut files: Vec<FileResult>, top_k: usize) -> Vec<FileResult> {
        match rank_by_similarity(
            self.embedder.as_ref(),
            query,
            files.clone(),
            FileResult::ranking_text,
            top_k,
        )
        .await
        {
            Ok(ranked) => ranked,
            Err(err) => {
                warn!("Ranking failed, keeping upstream order: {}", err);
                files.truncate(top_k);
                files
            }
        }
    }
}

/// `search(q='...')` with OData quote doubling.
fn search_segment(query: &str) -> String {
    format!("search(q='{}')", query.replace('\'', "''"))
}

pub struct SearchAggregator {
    executor: Arc<ResilientExecutor>,
    base_url: String,
    ranker: Arc<dyn RelevanceRanker>,
    top_k: usize,
}

impl SearchAggregator {
    pub fn new(
        executor: Arc<ResilientExecutor>,
        base_url: &str,
        ranker: Arc<dyn RelevanceRanker>,
        top_k: usize,
    ) -> Self {
        Self {
            executor,
            base_url: base_url.to_string(),
            ranker,
            top_k,
        }
    }

    /// Search the personal drive, then every drive of every site, and rank
    /// the union. Falls back to the recent-files list when nothing matched.
    /// Failed listings are logged and skipped.
    pub async fn search_all_files(&self, auth: &BearerAuth, query: &str) -> Vec<FileResult> {
        let segment = search_segment(query);
        let mut results: Vec<FileResult> = self
            .collect::<DriveItem>(&["me", "drive", "root", &segment], "", auth, "personal search")
            .await
            .into_iter()
            .map(|item| FileResult::from_item(item, ScopeTag::Personal))
            .collect();

        let sites = self
            .collect::<Site>(&["sites"], "?search=*", auth, "sites")
            .await;
        for site in sites {
            let drives = self
                .collect::<Drive>(&["sites", &site.id, "drives"], "", auth, "site drives")
                .await;
            for drive in drives {
                let found = self
                    .collect::<DriveItem>(&["drives", &drive.id, &segment], "", auth, "drive search")
                    .await;
                results.extend(
                    found
                        .into_iter()
                        .map(|item| FileResult::from_item(item, ScopeTag::Site(site.id.clone()))),
                );
            }
        }

        if results.is_empty() {
            info!("No results found via search. Fetching recent files as fallback.");
            results = self
                .collect::<DriveItem>(&["me", "drive", "recent"], "", auth, "recent files")
                .await
                .into_iter()
                .map(|item| FileResult::from_item(item, ScopeTag::Personal))
                .collect();
        }

        self.ranker.rank(query, results, self.top_k).await
    }

    /// Every item of a paginated listing, following `@odata.nextLink`.
    /// Stops at the first failed page, keeping what was already read.
    async fn collect<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        suffix: &str,
        auth: &BearerAuth,
        what: &str,
    ) -> Vec<T> {
        let first = match graph_url(&self.base_url, segments) {
            Ok(url) => format!("{url}{suffix}"),
            Err(err) => {
                error!("Failed to build {} url: {}", what, err);
                return Vec::new();
            }
        };

        let mut items = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                warn!("Pagination loop on {}", url);
                break;
            }
            match self.executor.get_json::<Page<T>>(&url, auth).await {
                Ok(page) => {
                    items.extend(page.value);
                    next = page.next_link;
                }
                Err(err) => {
                    error!("Failed to retrieve {}: {}", what, err);
                    break;
                }
            }
        }
        items
    }
}
