//! Query engine: embed the query text and run a kNN lookup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::Embedder;
use crate::error::{Error, Result};
use crate::index::{KnnHit, KnnQuery, VectorIndex};
use crate::schema::{IndexSchema, DESCRIPTION_FIELD, NAME_FIELD};

/// Hits returned when the caller does not say otherwise.
pub const DEFAULT_K: usize = 10;

/// Candidates examined by the engine before picking the top `k`.
pub const DEFAULT_CANDIDATE_POOL: usize = 500;

/// A search call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    pub k: usize,
    /// Larger pools raise recall at the cost of latency; must be at least `k`.
    pub candidate_pool: usize,
}

impl SearchRequest {
    /// Request with the default `k` and candidate pool.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            k: DEFAULT_K,
            candidate_pool: DEFAULT_CANDIDATE_POOL,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_candidate_pool(mut self, candidate_pool: usize) -> Self {
        self.candidate_pool = candidate_pool;
        self
    }
}

/// A hit projected down to its display fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultItem {
    pub id: u64,
    /// Engine relevance; a distance under `l2_norm`, lower is closer.
    pub score: f32,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Display fields the hit did not carry.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl ResultItem {
    /// Project a raw hit, recording absent display fields.
    ///
    /// A missing field is reported and left empty; the rest of the hit is kept.
    pub fn from_hit(hit: KnnHit) -> Self {
        let mut missing = Vec::new();
        let mut take = |field: &str| -> Option<String> {
            match hit.source.get(field) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => {
                    let err = Error::MissingField(field.to_string());
                    warn!(id = hit.id, error = %err, "Hit is missing a display field");
                    metrics::counter!("catalog_search_missing_fields_total").increment(1);
                    missing.push(field.to_string());
                    None
                }
                Some(other) => Some(other.to_string()),
            }
        };
        let name = take(NAME_FIELD);
        let description = take(DESCRIPTION_FIELD);
        Self {
            id: hit.id,
            score: hit.score,
            name,
            description,
            missing,
        }
    }
}

/// Embeds query text and retrieves the nearest catalog items.
pub struct QueryEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    index_name: String,
    vector_field: String,
    dims: usize,
}

impl QueryEngine {
    /// Build an engine for `index_name`, whose layout is `schema`.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        index_name: impl Into<String>,
        schema: &IndexSchema,
    ) -> Result<Self> {
        let (field, spec) = schema.knn_field();
        if embedder.dimension() != spec.dims {
            return Err(Error::DimensionMismatch {
                expected: spec.dims,
                actual: embedder.dimension(),
            });
        }
        Ok(Self {
            embedder,
            index,
            index_name: index_name.into(),
            vector_field: field.to_string(),
            dims: spec.dims,
        })
    }

    /// Run `request`, returning at most `k` items ordered closest first.
    ///
    /// Empty text is not rejected; it embeds to a degenerate vector.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<ResultItem>> {
        let knn = KnnQuery {
            field: self.vector_field.clone(),
            vector: Vec::new(),
            k: request.k,
            num_candidates: request.candidate_pool,
            source: vec![NAME_FIELD.to_string(), DESCRIPTION_FIELD.to_string()],
        };
        knn.validate()?;

        let embedder = Arc::clone(&self.embedder);
        let text = request.text.clone();
        let vector = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| Error::ModelInference(format!("embedding task failed: {}", e)))??;
        if vector.len() != self.dims {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }

        let knn = KnnQuery { vector, ..knn };
        let hits = self.index.knn_search(&self.index_name, &knn).await?;
        metrics::counter!("catalog_search_queries_total").increment(1);
        debug!(
            query = %request.text,
            k = request.k,
            candidates = request.candidate_pool,
            hits = hits.len(),
            "Search completed"
        );

        Ok(hits.into_iter().map(ResultItem::from_hit).collect())
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Number of documents currently searchable.
    pub async fn document_count(&self) -> Result<u64> {
        self.index.count(&self.index_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::schema::{Document, FieldValue, VECTOR_FIELD};
    use crate::search::HashingEmbedder;
    use rand::Rng;
    use serde_json::{json, Map};

    const IDX: &str = "products";
    const DIMS: usize = 32;

    async fn seeded(descriptions: &[&str]) -> (Arc<MemoryIndex>, QueryEngine) {
        let schema = IndexSchema::product_catalog(DIMS).unwrap();
        let embedder = Arc::new(HashingEmbedder::new(DIMS));
        let index = Arc::new(MemoryIndex::new());
        index.ensure_index(IDX, &schema).await.unwrap();
        for (i, description) in descriptions.iter().enumerate() {
            let mut doc = Document::new(i as u64 + 1);
            for field in schema.scalar_fields() {
                doc.insert(field, FieldValue::Text(format!("item {}", i + 1)));
            }
            doc.insert("ProductID", FieldValue::Long(i as i64 + 1));
            doc.insert("Price (INR)", FieldValue::Long(100));
            doc.insert("NumImages", FieldValue::Long(3));
            doc.insert(DESCRIPTION_FIELD, FieldValue::Text(description.to_string()));
            doc.insert(VECTOR_FIELD, FieldValue::Vector(embedder.embed(description).unwrap()));
            index.upsert(IDX, &doc).await.unwrap();
        }
        let engine = QueryEngine::new(embedder, index.clone(), IDX, &schema).unwrap();
        (index, engine)
    }

    #[tokio::test]
    async fn test_search_returns_closest_first() {
        let (_, engine) = seeded(&[
            "red leather handbag",
            "blue denim jeans",
            "white cotton t-shirt",
        ])
        .await;
        let results = engine
            .search(&SearchRequest::new("blue denim jeans"))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].description.as_deref(), Some("blue denim jeans"));
        assert!(results.windows(2).all(|w| w[0].score <= w[1].score));
        assert!(results.iter().all(|r| r.missing.is_empty()));
    }

    #[tokio::test]
    async fn test_search_never_exceeds_k() {
        let descriptions: Vec<String> = (0..25).map(|i| format!("product number {i}")).collect();
        let refs: Vec<&str> = descriptions.iter().map(String::as_str).collect();
        let (_, engine) = seeded(&refs).await;

        let results = engine.search(&SearchRequest::new("product")).await.unwrap();
        assert_eq!(results.len(), DEFAULT_K);
    }

    #[tokio::test]
    async fn test_small_index_returns_everything() {
        let (_, engine) = seeded(&["wool scarf", "silk tie"]).await;
        let request = SearchRequest::new("scarf").with_k(5).with_candidate_pool(5);
        let results = engine.search(&request).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_query_is_not_rejected() {
        let (_, engine) = seeded(&["wool scarf"]).await;
        let results = engine.search(&SearchRequest::new("")).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_smaller_than_k_is_invalid() {
        let (_, engine) = seeded(&["wool scarf"]).await;
        let request = SearchRequest::new("scarf").with_k(10).with_candidate_pool(3);
        assert!(matches!(
            engine.search(&request).await,
            Err(Error::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_random_queries_are_ordered() {
        let (_, engine) = seeded(&[
            "green canvas sneakers",
            "black formal shoes",
            "brown leather belt",
            "navy blue blazer",
            "grey hooded sweatshirt",
        ])
        .await;
        let words = ["green", "shoes", "leather", "blue", "grey", "belt", "canvas"];
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let query: Vec<&str> = (0..3).map(|_| words[rng.gen_range(0..words.len())]).collect();
            let results = engine
                .search(&SearchRequest::new(query.join(" ")).with_k(4))
                .await
                .unwrap();
            assert!(results.len() <= 4);
            assert!(results.windows(2).all(|w| w[0].score <= w[1].score));
        }
    }

    #[test]
    fn test_result_item_reports_missing_fields() {
        let mut source = Map::new();
        source.insert(NAME_FIELD.to_string(), json!("Wool Scarf"));
        let item = ResultItem::from_hit(KnnHit {
            id: 9,
            score: 0.25,
            source,
        });
        assert_eq!(item.name.as_deref(), Some("Wool Scarf"));
        assert_eq!(item.description, None);
        assert_eq!(item.missing, vec![DESCRIPTION_FIELD.to_string()]);
    }

    #[test]
    fn test_engine_rejects_embedder_dimension_mismatch() {
        let schema = IndexSchema::product_catalog(768).unwrap();
        let result = QueryEngine::new(
            Arc::new(HashingEmbedder::new(16)),
            Arc::new(MemoryIndex::new()),
            IDX,
            &schema,
        );
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch {
                expected: 768,
                actual: 16
            })
        ));
    }
}
