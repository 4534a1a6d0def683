//! Nearest-neighbor index backends.
//!
//! The [`VectorIndex`] trait is the seam between the pipeline and the
//! external search engine. [`QdrantIndex`] talks to a Qdrant server;
//! [`MemoryIndex`] keeps everything in process with the same semantics.

mod memory;
mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::{QdrantIndex, QdrantIndexConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::schema::{Document, IndexSchema};

/// Largest candidate pool accepted by a kNN request.
pub const MAX_NUM_CANDIDATES: usize = 10_000;

/// Outcome of [`VectorIndex::ensure_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// The index was created by this call.
    Created,
    /// The index was already present with a compatible schema.
    Existing,
}

/// A nearest-neighbor request.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnQuery {
    /// Vector field to search.
    pub field: String,
    pub vector: Vec<f32>,
    /// Hits to return.
    pub k: usize,
    /// Candidates examined before the top `k` are picked.
    pub num_candidates: usize,
    /// Stored fields to return with each hit.
    pub source: Vec<String>,
}

impl KnnQuery {
    /// Check the request parameters.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::InvalidQuery("k must be at least 1".into()));
        }
        if self.num_candidates < self.k {
            return Err(Error::InvalidQuery(format!(
                "candidate pool ({}) must be at least k ({})",
                self.num_candidates, self.k
            )));
        }
        if self.num_candidates > MAX_NUM_CANDIDATES {
            return Err(Error::InvalidQuery(format!(
                "candidate pool ({}) exceeds the maximum of {}",
                self.num_candidates, MAX_NUM_CANDIDATES
            )));
        }
        Ok(())
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnnHit {
    pub id: u64,
    /// Engine relevance; a distance for `l2_norm`, a similarity otherwise.
    pub score: f32,
    /// Projected stored fields.
    pub source: Map<String, Value>,
}

/// Storage and retrieval of vector-annotated documents.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create `name` with `schema` unless it already exists.
    ///
    /// An existing index is left untouched. It is an error only when its
    /// vector layout disagrees with `schema`.
    async fn ensure_index(&self, name: &str, schema: &IndexSchema) -> Result<IndexStatus>;

    /// Insert or overwrite the document keyed by `doc.id`.
    async fn upsert(&self, name: &str, doc: &Document) -> Result<()>;

    /// Top `k` hits ordered from closest to farthest.
    async fn knn_search(&self, name: &str, query: &KnnQuery) -> Result<Vec<KnnHit>>;

    /// Number of stored documents.
    async fn count(&self, name: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(k: usize, num_candidates: usize) -> KnnQuery {
        KnnQuery {
            field: "v".into(),
            vector: vec![0.0],
            k,
            num_candidates,
            source: vec![],
        }
    }

    #[test]
    fn test_knn_query_validation() {
        assert!(query(10, 500).validate().is_ok());
        assert!(query(5, 5).validate().is_ok());
        assert!(matches!(query(0, 5).validate(), Err(Error::InvalidQuery(_))));
        assert!(matches!(query(10, 5).validate(), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            query(10, MAX_NUM_CANDIDATES + 1).validate(),
            Err(Error::InvalidQuery(_))
        ));
    }
}
