//! Text embeddings and similarity ordering for search candidates.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use tokio::task;
use tracing::{debug, info, warn};

/// Turns a batch of texts into one vector per text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

/// ONNX sentence embeddings. The model runs on the blocking pool.
#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn load(settings: &EmbedSettings) -> Result<Self> {
        let model = EmbeddingModel::from_str(&settings.model).unwrap_or_else(|_| {
            warn!("unknown embedding model {:?}, using all-MiniLM-L6-v2", settings.model);
            EmbeddingModel::AllMiniLML6V2
        });
        let mut options = TextInitOptions::new(model);
        if let Some(dir) = &settings.cache_dir {
            options = options.with_cache_dir(dir.clone());
        }
        let model = TextEmbedding::try_new(options)?;
        info!("loaded embedding model {}", settings.model);
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let model = self.model.clone();
        let vectors = task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("embedding model lock poisoned"))?;
            Ok::<_, anyhow::Error>(guard.embed(texts, None)?)
        })
        .await??;
        ensure!(
            vectors.len() == expected,
            "embedding model returned {} vectors for {} texts",
            vectors.len(),
            expected
        );
        Ok(vectors)
    }
}

/// Bag-of-words embedder over lowercase alphanumeric runs.
///
/// Deterministic and dependency free; file names like `Q3-Budget.xlsx` share
/// the `budget` bucket with a query for "budget".
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    pub dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

impl HashEmbedder {
    fn bucket(&self, token: &str) -> usize {
        let hash = token
            .bytes()
            .fold(5381u64, |h, b| (h << 5).wrapping_add(h) ^ u64::from(b));
        (hash % self.dims as u64) as usize
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut counts = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .for_each(|token| counts[self.bucket(token)] += 1.0);
        counts
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        ensure!(self.dims > 0, "hash embedder needs at least one dimension");
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Order `items` by cosine similarity of their text to `query` and keep the
/// best `top_k`. Ties keep their incoming order.
///
/// The query and every candidate go to the embedder in a single batch.
pub async fn rank_by_similarity<T, F>(
    embedder: &dyn Embedder,
    query: &str,
    items: Vec<T>,
    text_of: F,
    top_k: usize,
) -> Result<Vec<T>>
where
    F: Fn(&T) -> String,
{
    if items.is_empty() || top_k == 0 {
        return Ok(Vec::new());
    }

    let batch: Vec<String> = std::iter::once(query.to_string())
        .chain(items.iter().map(&text_of))
        .collect();
    let mut vectors = embedder.embed(batch).await?.into_iter();
    let query_vector = vectors
        .next()
        .ok_or_else(|| anyhow!("embedder returned no vector for the query"))?;
    let scores: Vec<f32> = vectors.map(|v| cosine_similarity(&query_vector, &v)).collect();
    ensure!(
        scores.len() == items.len(),
        "embedder returned {} candidate vectors for {} candidates",
        scores.len(),
        items.len()
    );

    let mut scored: Vec<(f32, T)> = scores.into_iter().zip(items).collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    debug!("ranked {} candidates for {:?}", scored.len(), query);
    Ok(scored.into_iter().take(top_k).map(|(_, item)| item).collect())
}

/// Cosine of the angle between `a` and `b`; zero when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedBackend {
    FastEmbed,
    Hash,
}

/// Embedding backend selection, read from `DOCSEEK_EMBED_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedSettings {
    pub backend: EmbedBackend,
    pub model: String,
    pub cache_dir: Option<PathBuf>,
}

impl EmbedSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend = match lookup("DOCSEEK_EMBED_BACKEND") {
            Some(name) if name.eq_ignore_ascii_case("hash") => EmbedBackend::Hash,
            _ => EmbedBackend::FastEmbed,
        };
        Self {
            backend,
            model: lookup("DOCSEEK_EMBED_MODEL").unwrap_or_else(|| "all-MiniLM-L6-v2".to_string()),
            cache_dir: lookup("DOCSEEK_EMBED_CACHE_DIR").map(PathBuf::from),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn Embedder>> {
        let embedder: Arc<dyn Embedder> = match self.backend {
            EmbedBackend::Hash => Arc::new(HashEmbedder::default()),
            EmbedBackend::FastEmbed => Arc::new(FastEmbedder::load(self)?),
        };
        Ok(embedder)
    }
}

/// The configured embedder, or the hash embedder when the model can't load.
pub fn embedder_from_env_or_hash() -> Arc<dyn Embedder> {
    match EmbedSettings::from_env().build() {
        Ok(embedder) => embedder,
        Err(err) => {
            warn!("fast embedding unavailable, falling back to hash embedder: {}", err);
            Arc::new(HashEmbedder::default())
        }
    }
}
