//! Configuration for catalog search.
//!
//! Values come from a TOML file, then environment overrides (a `.env` file
//! in the working directory is honored), then built-in defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{DEFAULT_ROW_LIMIT, DEFAULT_SENTINEL};
use crate::error::{Error, Result};
use crate::index::QdrantIndexConfig;
use crate::ingest::{IngestOptions, InferenceFailurePolicy};
use crate::search::{EmbeddingServiceConfig, DEFAULT_CANDIDATE_POOL, DEFAULT_K, DEFAULT_MODEL};

/// Default name of the product index.
pub const DEFAULT_INDEX_NAME: &str = "all_products";

/// Which index engine to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    #[default]
    Qdrant,
    /// Process-local; contents are lost on exit.
    Memory,
}

/// Which embedding provider to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    #[default]
    Fastembed,
    /// Model-free feature hashing; no download required.
    Hashing,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub index: IndexSection,
    pub embedding: EmbeddingSection,
    pub ingest: IngestSection,
    pub query: QuerySection,
    pub api: ApiSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    pub backend: IndexBackend,
    /// Index (collection) name.
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for IndexSection {
    fn default() -> Self {
        let qdrant = QdrantIndexConfig::default();
        Self {
            backend: IndexBackend::default(),
            name: DEFAULT_INDEX_NAME.to_string(),
            url: qdrant.url,
            api_key: qdrant.api_key,
            timeout_secs: qdrant.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub provider: EmbeddingProvider,
    pub model: String,
    /// Vector length; must match the model.
    pub dimension: usize,
    pub batch_size: usize,
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: DEFAULT_MODEL.to_string(),
            dimension: crate::search::EMBEDDING_DIM,
            batch_size: 32,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub catalog_path: PathBuf,
    /// Rows read from the catalog; `0` reads them all.
    pub row_limit: usize,
    pub sentinel: String,
    pub on_inference_error: InferenceFailurePolicy,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("./data/products.csv"),
            row_limit: DEFAULT_ROW_LIMIT,
            sentinel: DEFAULT_SENTINEL.to_string(),
            on_inference_error: InferenceFailurePolicy::default(),
        }
    }
}

impl IngestSection {
    /// Row limit as an option, `None` meaning unlimited.
    pub fn row_limit(&self) -> Option<usize> {
        (self.row_limit > 0).then_some(self.row_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    pub k: usize,
    pub candidate_pool: usize,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            candidate_pool: DEFAULT_CANDIDATE_POOL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub listen_address: String,
    pub cors_enabled: bool,
    pub metrics_enabled: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            cors_enabled: false,
            metrics_enabled: true,
        }
    }
}

impl SearchConfig {
    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SearchConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        report_env_file(dotenvy::dotenv());
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// `INDEX_URL` replaces the whole endpoint; `INDEX_PORT` only swaps the
    /// port of the current one.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("INDEX_URL") {
            self.index.url = url;
        }
        if let Some(port) = lookup("INDEX_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Config(format!("INDEX_PORT is not a port: {}", port)))?;
            self.index.url = replace_port(&self.index.url, port);
        }
        if let Some(key) = lookup("INDEX_API_KEY") {
            self.index.api_key = Some(key);
        }
        if let Some(name) = lookup("INDEX_NAME") {
            self.index.name = name;
        }
        if let Some(path) = lookup("CATALOG_PATH") {
            self.ingest.catalog_path = PathBuf::from(path);
        }
        if let Some(limit) = lookup("INGEST_ROW_LIMIT") {
            self.ingest.row_limit = limit
                .parse()
                .map_err(|_| Error::Config(format!("INGEST_ROW_LIMIT is not a number: {}", limit)))?;
        }
        debug!(url = %self.index.url, index = %self.index.name, "Applied environment overrides");
        self.validate()
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.index.name.trim().is_empty() {
            return Err(Error::Config("index.name must not be empty".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(Error::Config("embedding.dimension must be positive".into()));
        }
        if self.query.k == 0 {
            return Err(Error::Config("query.k must be positive".into()));
        }
        if self.query.candidate_pool < self.query.k {
            return Err(Error::Config(format!(
                "query.candidate_pool ({}) must be at least query.k ({})",
                self.query.candidate_pool, self.query.k
            )));
        }
        Ok(())
    }

    pub fn qdrant(&self) -> QdrantIndexConfig {
        QdrantIndexConfig {
            url: self.index.url.clone(),
            api_key: self.index.api_key.clone(),
            timeout_secs: self.index.timeout_secs,
        }
    }

    pub fn embedding_service(&self) -> EmbeddingServiceConfig {
        EmbeddingServiceConfig {
            model: self.embedding.model.clone(),
            batch_size: self.embedding.batch_size,
            cache_dir: self.embedding.cache_dir.clone(),
            show_download_progress: false,
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            sentinel: self.ingest.sentinel.clone(),
            batch_size: self.embedding.batch_size,
            on_inference_error: self.ingest.on_inference_error,
        }
    }
}

/// Log the outcome of loading a `.env` file. Only a missing file is silent.
fn report_env_file(loaded: std::result::Result<PathBuf, dotenvy::Error>) -> bool {
    match loaded {
        Ok(path) => {
            debug!(path = %path.display(), "Loaded environment file");
            true
        }
        Err(e) if e.not_found() => false,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable .env file");
            false
        }
    }
}

/// Swap the port of `url`, appending one if it has none.
fn replace_port(url: &str, port: u16) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (format!("{}://", scheme), rest),
        None => (String::new(), url),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let host = match authority.rsplit_once(':') {
        Some((host, maybe_port)) if maybe_port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    format!("{}{}:{}{}", scheme, host, port, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = SearchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.index.name, DEFAULT_INDEX_NAME);
        assert_eq!(config.embedding.dimension, 768);
        assert_eq!(config.ingest.row_limit(), Some(100));
        assert_eq!(config.query.k, 10);
        assert_eq!(config.query.candidate_pool, 500);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = SearchConfig::default();
        config.index.name = "shoes".into();
        config.ingest.row_limit = 0;
        config.save(&path).unwrap();

        let loaded = SearchConfig::load(&path).unwrap();
        assert_eq!(loaded.index.name, "shoes");
        assert_eq!(loaded.ingest.row_limit(), None);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[query]\nk = 3\n").unwrap();
        let config = SearchConfig::load(&path).unwrap();
        assert_eq!(config.query.k, 3);
        assert_eq!(config.query.candidate_pool, DEFAULT_CANDIDATE_POOL);
        assert_eq!(config.embedding.provider, EmbeddingProvider::Fastembed);
    }

    #[test]
    fn test_pool_below_k_is_rejected() {
        let mut config = SearchConfig::default();
        config.query.candidate_pool = 5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("INDEX_PORT", "7000"),
            ("INDEX_API_KEY", "secret"),
            ("INGEST_ROW_LIMIT", "25"),
        ]
        .into_iter()
        .collect();
        let mut config = SearchConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.index.url, "http://localhost:7000");
        assert_eq!(config.index.api_key.as_deref(), Some("secret"));
        assert_eq!(config.ingest.row_limit(), Some(25));
    }

    #[test]
    fn test_bad_port_override_fails() {
        let mut config = SearchConfig::default();
        let err = config
            .apply_overrides(|k| (k == "INDEX_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_file_outcomes() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dotenvy::from_path(dir.path().join("absent.env")).unwrap_err();
        assert!(missing.not_found());
        assert!(!report_env_file(Err(missing)));

        let malformed = dir.path().join("malformed.env");
        std::fs::write(&malformed, "CATALOG_SEARCH_UNTERMINATED=\"open\n").unwrap();
        let err = dotenvy::from_path(&malformed).unwrap_err();
        assert!(!err.not_found());
        assert!(!report_env_file(Err(err)));

        assert!(report_env_file(Ok(malformed)));
    }

    #[test]
    fn test_replace_port() {
        assert_eq!(replace_port("http://es01:9200", 9300), "http://es01:9300");
        assert_eq!(replace_port("https://es01", 9200), "https://es01:9200");
        assert_eq!(replace_port("localhost:6334/api", 1), "localhost:1/api");
    }
}
