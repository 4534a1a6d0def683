//! Text embedding providers.
//!
//! [`EmbeddingService`] runs a sentence-embedding model locally through
//! FastEmbed. [`HashingEmbedder`] is a deterministic, model-free stand-in used
//! for offline runs and tests.

use std::path::PathBuf;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DEFAULT_MODEL, EMBEDDING_DIM};
use crate::error::{Error, Result};

/// A dense embedding vector.
pub type Embedding = Vec<f32>;

/// Turns text into fixed-length vectors.
///
/// Implementations must be deterministic for a fixed model: the same text
/// always yields the same vector.
pub trait Embedder: Send + Sync {
    /// Name of the underlying model.
    fn model_name(&self) -> &str;

    /// Length of every produced vector.
    fn dimension(&self) -> usize;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed several texts, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Configuration for [`EmbeddingService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingServiceConfig {
    /// Model name, e.g. `bge-base-en-v1.5`.
    pub model: String,
    /// Texts per inference call.
    pub batch_size: usize,
    /// Where downloaded model files are kept.
    pub cache_dir: Option<PathBuf>,
    /// Show download progress on first use.
    pub show_download_progress: bool,
}

impl Default for EmbeddingServiceConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            batch_size: 32,
            cache_dir: None,
            show_download_progress: false,
        }
    }
}

/// Map a model name onto a FastEmbed model and its output dimension.
///
/// FastEmbed has no ONNX export of `all-mpnet-base-v2`, so that name resolves
/// to `bge-base-en-v1.5`, which has the same 768 dims. The vectors differ, so
/// an index filled by the mpnet model must be re-ingested.
fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize)> {
    let resolved = match name {
        "bge-base-en-v1.5" | "BAAI/bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
        "all-mpnet-base-v2" | "sentence-transformers/all-mpnet-base-v2" => {
            (EmbeddingModel::BGEBaseENV15, 768)
        }
        "bge-small-en-v1.5" | "BAAI/bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
        "bge-large-en-v1.5" | "BAAI/bge-large-en-v1.5" => (EmbeddingModel::BGELargeENV15, 1024),
        "all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
            (EmbeddingModel::AllMiniLML6V2, 384)
        }
        "nomic-embed-text-v1.5" | "nomic-ai/nomic-embed-text-v1.5" => {
            (EmbeddingModel::NomicEmbedTextV15, 768)
        }
        other => {
            return Err(Error::Config(format!(
                "unknown embedding model '{}'",
                other
            )))
        }
    };
    Ok(resolved)
}

/// Local sentence-embedding model.
///
/// Loaded once at construction and reused for every call; callers own the
/// instance and pass it to the ingestion and query stages.
pub struct EmbeddingService {
    model: TextEmbedding,
    model_name: String,
    dimension: usize,
    batch_size: usize,
}

impl EmbeddingService {
    /// Load the default model.
    pub fn new() -> Result<Self> {
        Self::with_config(EmbeddingServiceConfig::default())
    }

    /// Load the model named in `config`, downloading it on first use.
    pub fn with_config(config: EmbeddingServiceConfig) -> Result<Self> {
        let (model, dimension) = resolve_model(&config.model)?;
        info!(model = %config.model, dimension, "Loading embedding model");

        let mut options =
            InitOptions::new(model).with_show_download_progress(config.show_download_progress);
        if let Some(dir) = config.cache_dir.clone() {
            options = options.with_cache_dir(dir);
        }
        let model = TextEmbedding::try_new(options).map_err(|e| {
            Error::ModelInference(format!("failed to load model '{}': {}", config.model, e))
        })?;

        Ok(Self {
            model,
            model_name: config.model,
            dimension,
            batch_size: config.batch_size.max(1),
        })
    }

    fn run(&self, texts: Vec<&str>) -> Result<Vec<Embedding>> {
        let expected = texts.len();
        let vectors = self
            .model
            .embed(texts, Some(self.batch_size))
            .map_err(|e| Error::ModelInference(e.to_string()))?;
        if vectors.len() != expected {
            return Err(Error::ModelInference(format!(
                "model returned {} embeddings for {} inputs",
                vectors.len(),
                expected
            )));
        }
        Ok(vectors)
    }
}

impl Embedder for EmbeddingService {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        self.run(vec![text])?
            .pop()
            .ok_or_else(|| Error::ModelInference("model returned no embedding".into()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = texts.len(), "Embedding batch");
        self.run(texts.iter().map(String::as_str).collect())
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Feature-hashing embedder.
///
/// Lowercased alphanumeric tokens are hashed with FNV-1a into signed buckets
/// and the result is L2-normalized. Texts sharing words land close together,
/// which is enough for offline runs and for exercising the pipeline in tests.
/// Empty text maps to the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "fnv1a-hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }
}
