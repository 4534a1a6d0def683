//! Explicit pipeline stages: schema setup, ingestion, query serving.
//!
//! [`SearchApp`] owns the embedding model and the index client for the
//! process and hands shared references to each stage.

use std::sync::Arc;

use tracing::info;

use crate::catalog::CatalogReader;
use crate::config::{EmbeddingProvider, IndexBackend, SearchConfig};
use crate::error::{Error, Result};
use crate::index::{IndexStatus, MemoryIndex, QdrantIndex, VectorIndex};
use crate::ingest::{IngestReport, IngestionPipeline};
use crate::schema::IndexSchema;
use crate::search::{Embedder, EmbeddingService, HashingEmbedder, QueryEngine};

/// Owned model, index client and schema shared by all stages.
pub struct SearchApp {
    config: SearchConfig,
    schema: IndexSchema,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl SearchApp {
    /// Assemble from explicit parts.
    pub fn new(
        config: SearchConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        if embedder.dimension() != config.embedding.dimension {
            return Err(Error::Config(format!(
                "model '{}' produces {} dims but embedding.dimension is {}",
                embedder.model_name(),
                embedder.dimension(),
                config.embedding.dimension
            )));
        }
        let schema = IndexSchema::product_catalog(config.embedding.dimension)?;
        Ok(Self {
            config,
            schema,
            embedder,
            index,
        })
    }

    /// Load the model and connect to the index named in `config`.
    pub async fn from_config(config: SearchConfig) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = match config.embedding.provider {
            EmbeddingProvider::Fastembed => {
                Arc::new(EmbeddingService::with_config(config.embedding_service())?)
            }
            EmbeddingProvider::Hashing => {
                Arc::new(HashingEmbedder::new(config.embedding.dimension))
            }
        };
        let index: Arc<dyn VectorIndex> = match config.index.backend {
            IndexBackend::Qdrant => Arc::new(QdrantIndex::connect(&config.qdrant()).await?),
            IndexBackend::Memory => Arc::new(MemoryIndex::new()),
        };
        Self::new(config, embedder, index)
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Stage 1: make sure the index exists.
    pub async fn setup(&self) -> Result<IndexStatus> {
        let status = self
            .index
            .ensure_index(&self.config.index.name, &self.schema)
            .await?;
        info!(index = %self.config.index.name, ?status, "Index ready");
        Ok(status)
    }

    pub fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.index.name.clone(),
            self.schema.clone(),
        )
        .with_options(self.config.ingest_options())
    }

    /// Stage 2: read the configured catalog and ingest it.
    pub async fn ingest_catalog(&self) -> Result<IngestReport> {
        let rows = CatalogReader::new(&self.config.ingest.catalog_path)
            .with_row_limit(self.config.ingest.row_limit())
            .read()?;
        self.pipeline().ingest(rows).await
    }

    /// Stage 3: engine for answering queries.
    pub fn query_engine(&self) -> Result<QueryEngine> {
        QueryEngine::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.index.name.clone(),
            &self.schema,
        )
    }
}
