//! In-process index with exact nearest-neighbor search.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{IndexStatus, KnnHit, KnnQuery, VectorIndex};
use crate::error::{Error, Result};
use crate::schema::{Document, FieldType, IndexSchema};

struct Collection {
    schema: IndexSchema,
    docs: BTreeMap<u64, Document>,
}

/// Index kept entirely in memory.
///
/// Mirrors the engine contract: creation is idempotent, documents are
/// validated against the declared field types, upserts overwrite by id, and
/// search scans every stored vector.
#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema the named index was created with.
    pub async fn schema(&self, name: &str) -> Option<IndexSchema> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.schema.clone())
    }

    /// Stored copy of a document.
    pub async fn get(&self, name: &str, id: u64) -> Option<Document> {
        self.collections
            .read()
            .await
            .get(name)
            .and_then(|c| c.docs.get(&id).cloned())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_index(&self, name: &str, schema: &IndexSchema) -> Result<IndexStatus> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            if existing.schema.knn_field() != schema.knn_field() {
                return Err(Error::SchemaMismatch {
                    index: name.to_string(),
                    reason: format!(
                        "existing vector field {:?} differs from requested {:?}",
                        existing.schema.knn_field(),
                        schema.knn_field()
                    ),
                });
            }
            debug!(index = name, "Index already exists");
            return Ok(IndexStatus::Existing);
        }
        collections.insert(
            name.to_string(),
            Collection {
                schema: schema.clone(),
                docs: BTreeMap::new(),
            },
        );
        info!(index = name, "Created in-memory index");
        Ok(IndexStatus::Created)
    }

    async fn upsert(&self, name: &str, doc: &Document) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        collection.schema.validate_document(doc)?;
        collection.docs.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn knn_search(&self, name: &str, query: &KnnQuery) -> Result<Vec<KnnHit>> {
        query.validate()?;
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;

        let spec = match collection.schema.field_type(&query.field) {
            Some(FieldType::DenseVector(spec)) if spec.indexed => spec,
            _ => {
                return Err(Error::InvalidQuery(format!(
                    "field '{}' is not a searchable vector field",
                    query.field
                )))
            }
        };
        if query.vector.len() != spec.dims {
            return Err(Error::DimensionMismatch {
                expected: spec.dims,
                actual: query.vector.len(),
            });
        }

        let mut scored: Vec<(f32, &Document)> = collection
            .docs
            .values()
            .filter_map(|doc| {
                let stored = doc.get(&query.field)?.as_vector()?;
                Some((spec.similarity.score(&query.vector, stored), doc))
            })
            .collect();

        scored.sort_by(|(a, da), (b, db)| {
            let by_score = if spec.similarity.is_distance() {
                a.partial_cmp(b)
            } else {
                b.partial_cmp(a)
            };
            by_score.unwrap_or(Ordering::Equal).then(da.id.cmp(&db.id))
        });

        let hits = scored
            .into_iter()
            .take(query.k)
            .map(|(score, doc)| {
                let source: Map<_, _> = query
                    .source
                    .iter()
                    .filter_map(|f| doc.get(f).map(|v| (f.clone(), v.to_json())))
                    .collect();
                KnnHit {
                    id: doc.id,
                    score,
                    source,
                }
            })
            .collect();
        Ok(hits)
    }

    async fn count(&self, name: &str) -> Result<u64> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.docs.len() as u64)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }
}
