//! Semantic search over a product catalog.
//!
//! Catalog rows are turned into vector-annotated documents, stored in a
//! nearest-neighbor index, and retrieved by embedding a free-text query with
//! the same model.
//!
//! The stages are independent: [`SearchApp::setup`] ensures the index,
//! [`IngestionPipeline::ingest`] loads documents, and [`QueryEngine::search`]
//! answers queries. Each takes its model and index client explicitly, so any
//! of them can run against [`MemoryIndex`] and [`HashingEmbedder`] in tests.

pub mod api;
pub mod app;
pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod schema;
pub mod search;

pub use api::{ApiConfig, ApiServer, AppState};
pub use app::SearchApp;
pub use catalog::{CatalogReader, RawRow, DEFAULT_ROW_LIMIT, DEFAULT_SENTINEL};
pub use config::{EmbeddingProvider, IndexBackend, SearchConfig};
pub use error::{Error, Result};
pub use index::{
    IndexStatus, KnnHit, KnnQuery, MemoryIndex, QdrantIndex, QdrantIndexConfig, VectorIndex,
};
pub use ingest::{IngestOptions, IngestReport, IngestionPipeline, InferenceFailurePolicy};
pub use schema::{Document, FieldType, FieldValue, IndexSchema, Similarity};
pub use search::{
    Embedder, Embedding, EmbeddingService, HashingEmbedder, QueryEngine, ResultItem,
    SearchRequest, EMBEDDING_DIM,
};
