//! Semantic search over the product catalog.
//!
//! Provides vector-based retrieval using:
//! - FastEmbed for embedding generation (ONNX-based, runs locally)
//! - A nearest-neighbor index (Qdrant, or in-memory) for storage and lookup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │  Catalog rows   │────▶│ EmbeddingService│◀────┐
//! │   (CSV text)    │     │   (FastEmbed)   │     │
//! └─────────────────┘     └───────┬─────────┘     │
//!                                 │               │
//!                                 ▼               │
//!                         ┌──────────────┐   ┌────┴─────┐
//!                         │  Embedding   │   │  Query   │
//!                         │  [f32; 768]  │   │  text    │
//!                         └──────┬───────┘   └────┬─────┘
//!                                │ upsert         │ kNN
//!                                ▼                ▼
//!                         ┌────────────────────────────┐
//!                         │        VectorIndex         │
//!                         │  (l2_norm, 768 dims)       │
//!                         └─────────────┬──────────────┘
//!                                       ▼
//!                              ┌──────────────┐
//!                              │ ResultItems  │
//!                              └──────────────┘
//! ```

mod embedding;
mod query;

pub use embedding::{Embedder, Embedding, EmbeddingService, EmbeddingServiceConfig, HashingEmbedder};
pub use query::{QueryEngine, ResultItem, SearchRequest, DEFAULT_CANDIDATE_POOL, DEFAULT_K};

/// Default embedding model (bge-base-en-v1.5 - 768 dimensions)
pub const DEFAULT_MODEL: &str = "bge-base-en-v1.5";

/// Embedding dimension for the default model
pub const EMBEDDING_DIM: usize = 768;
