//! Qdrant-backed index.
//!
//! Each schema maps onto one collection: the indexed vector field becomes a
//! named dense vector, scalar fields become payload (with payload indexes),
//! and the catalog identifier becomes the numeric point id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::with_payload_selector::SelectorOptions;
use qdrant_client::qdrant::{
    vectors_config, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    Distance, FieldType as PayloadFieldType, ListValue, NamedVectors, PayloadIncludeSelector, PointStruct,
    SearchParamsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParams, VectorParamsBuilder, VectorsConfigBuilder,
};
use qdrant_client::{Payload, Qdrant, QdrantError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tonic::Code;
use tracing::{debug, info, warn};

use super::{IndexStatus, KnnHit, KnnQuery, VectorIndex};
use crate::error::{Error, Result};
use crate::schema::{Document, FieldType, FieldValue, IndexSchema, Similarity, VectorSpec};

/// Connection settings for [`QdrantIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantIndexConfig {
    /// gRPC endpoint, e.g. `http://localhost:6334`.
    pub url: String,
    /// API key, if the server requires one.
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for QdrantIndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Index stored in a Qdrant collection.
pub struct QdrantIndex {
    client: Qdrant,
    /// Schemas of collections ensured through this client.
    schemas: RwLock<HashMap<String, IndexSchema>>,
}

fn distance(similarity: Similarity) -> Distance {
    match similarity {
        Similarity::L2Norm => Distance::Euclid,
        Similarity::Cosine => Distance::Cosine,
        Similarity::DotProduct => Distance::Dot,
    }
}

fn connection_error(operation: &str, err: impl std::fmt::Display) -> Error {
    Error::Connection(format!("{}: {}", operation, err))
}

/// Server-side refusals of the request itself, as opposed to transport failures.
fn is_request_rejection(code: Code) -> bool {
    matches!(
        code,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange | Code::AlreadyExists
    )
}

/// Classify a failed point upsert. A refused point only rejects that document.
fn upsert_error(index: &str, id: u64, err: QdrantError) -> Error {
    match err {
        QdrantError::ResponseError { status } if status.code() == Code::NotFound => {
            Error::IndexNotFound(index.to_string())
        }
        QdrantError::ResponseError { status } if is_request_rejection(status.code()) => {
            Error::DocumentRejected {
                id: Some(id),
                reason: status.message().to_string(),
            }
        }
        QdrantError::ConversionError(reason) => Error::DocumentRejected {
            id: Some(id),
            reason,
        },
        other => connection_error("upsert", other),
    }
}

/// Classify a failed collection create once the collection is known not to exist.
fn create_error(index: &str, err: QdrantError) -> Error {
    match err {
        QdrantError::ResponseError { status } if is_request_rejection(status.code()) => {
            Error::InvalidSchema(format!(
                "create collection '{}': {}",
                index,
                status.message()
            ))
        }
        other => connection_error("create collection", other),
    }
}

/// Compare an existing collection's vector parameters with the declared spec.
fn compare_vector_params(
    index: &str,
    field: &str,
    params: Option<&VectorParams>,
    spec: VectorSpec,
) -> Result<()> {
    let mismatch = |reason: String| Error::SchemaMismatch {
        index: index.to_string(),
        reason,
    };
    match params {
        None => Err(mismatch(format!("no named vector '{}'", field))),
        Some(p) if p.size != spec.dims as u64 => Err(mismatch(format!(
            "vector '{}' has {} dims, schema declares {}",
            field, p.size, spec.dims
        ))),
        Some(p) if p.distance != distance(spec.similarity) as i32 => Err(mismatch(format!(
            "vector '{}' uses a different distance than {}",
            field,
            spec.similarity.as_str()
        ))),
        Some(_) => Ok(()),
    }
}

impl QdrantIndex {
    /// Build a client and confirm the server answers.
    pub async fn connect(config: &QdrantIndexConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.url)
            .api_key(config.api_key.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| connection_error("client setup", e))?;

        let health = client
            .health_check()
            .await
            .map_err(|e| connection_error(&format!("cannot reach {}", config.url), e))?;
        info!(url = %config.url, version = %health.version, "Connected to Qdrant");

        Ok(Self {
            client,
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// Vector parameters of an existing collection's named vector.
    async fn existing_vector_params(&self, name: &str, field: &str) -> Result<Option<VectorParams>> {
        let info = self
            .client
            .collection_info(name)
            .await
            .map_err(|e| connection_error("collection info", e))?;
        let config = info
            .result
            .and_then(|i| i.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);
        Ok(match config {
            Some(vectors_config::Config::ParamsMap(map)) => map.map.get(field).cloned(),
            _ => None,
        })
    }

    async fn check_existing(&self, name: &str, schema: &IndexSchema) -> Result<()> {
        let (field, spec) = schema.knn_field();
        let params = self.existing_vector_params(name, field).await?;
        compare_vector_params(name, field, params.as_ref(), spec)
    }

    async fn schema_for(&self, name: &str) -> Result<IndexSchema> {
        self.schemas
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }
}

fn to_point(schema: &IndexSchema, doc: &Document) -> PointStruct {
    let (knn_field, _) = schema.knn_field();
    let mut vectors = NamedVectors::default();
    let mut payload = Payload::new();
    for (field, value) in &doc.fields {
        match value {
            FieldValue::Vector(v) if field == knn_field => {
                vectors = vectors.add_vector(field.clone(), v.clone());
            }
            FieldValue::Vector(v) => {
                let values = v
                    .iter()
                    .map(|x| QdrantValue {
                        kind: Some(Kind::DoubleValue(f64::from(*x))),
                    })
                    .collect();
                payload.insert(
                    field.clone(),
                    QdrantValue {
                        kind: Some(Kind::ListValue(ListValue { values })),
                    },
                );
            }
            FieldValue::Long(n) => payload.insert(field.clone(), *n),
            FieldValue::Text(s) => payload.insert(field.clone(), s.clone()),
        }
    }
    PointStruct::new(doc.id, vectors, payload)
}

fn to_json(value: QdrantValue) -> Value {
    match value.kind {
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => Value::from(d),
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::ListValue(list)) => Value::Array(list.values.into_iter().map(to_json).collect()),
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, to_json(v)))
                .collect(),
        ),
        Some(Kind::NullValue(_)) | None => Value::Null,
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_index(&self, name: &str, schema: &IndexSchema) -> Result<IndexStatus> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| connection_error("collection exists", e))?;

        let status = if exists {
            self.check_existing(name, schema).await?;
            debug!(index = name, "Collection already exists");
            IndexStatus::Existing
        } else {
            let (field, VectorSpec { dims, similarity, .. }) = schema.knn_field();
            let mut vectors = VectorsConfigBuilder::default();
            vectors.add_named_vector_params(
                field,
                VectorParamsBuilder::new(dims as u64, distance(similarity)),
            );
            let created = self
                .client
                .create_collection(CreateCollectionBuilder::new(name).vectors_config(vectors))
                .await;
            if let Err(e) = created {
                // Another writer may have created it between the check and the create.
                let raced = self
                    .client
                    .collection_exists(name)
                    .await
                    .map_err(|e| connection_error("collection exists", e))?;
                if raced {
                    self.check_existing(name, schema).await?;
                    self.schemas
                        .write()
                        .await
                        .insert(name.to_string(), schema.clone());
                    return Ok(IndexStatus::Existing);
                }
                return Err(create_error(name, e));
            }

            for spec in schema.fields() {
                let field_type = match spec.field_type {
                    FieldType::Long => PayloadFieldType::Integer,
                    FieldType::Text => PayloadFieldType::Text,
                    FieldType::DenseVector(_) => continue,
                };
                if let Err(e) = self
                    .client
                    .create_field_index(
                        CreateFieldIndexCollectionBuilder::new(name, spec.name.as_str(), field_type)
                            .wait(true),
                    )
                    .await
                {
                    warn!(index = name, field = %spec.name, error = %e, "Payload index not created");
                }
            }
            info!(index = name, dims, similarity = similarity.as_str(), "Created collection");
            IndexStatus::Created
        };

        self.schemas
            .write()
            .await
            .insert(name.to_string(), schema.clone());
        Ok(status)
    }

    async fn upsert(&self, name: &str, doc: &Document) -> Result<()> {
        let schema = self.schema_for(name).await?;
        // Payload is schemaless on the server, so declared types are enforced here.
        schema.validate_document(doc)?;
        self.client
            .upsert_points(UpsertPointsBuilder::new(name, vec![to_point(&schema, doc)]).wait(true))
            .await
            .map_err(|e| upsert_error(name, doc.id, e))?;
        Ok(())
    }

    async fn knn_search(&self, name: &str, query: &KnnQuery) -> Result<Vec<KnnHit>> {
        query.validate()?;
        let request = SearchPointsBuilder::new(name, query.vector.clone(), query.k as u64)
            .vector_name(query.field.as_str())
            .with_payload(SelectorOptions::Include(PayloadIncludeSelector {
                fields: query.source.clone(),
            }))
            .params(SearchParamsBuilder::default().hnsw_ef(query.num_candidates as u64));

        let response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| connection_error("search", e))?;

        let hits = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = match point.id.and_then(|id| id.point_id_options) {
                    Some(PointIdOptions::Num(n)) => n,
                    other => {
                        warn!(index = name, id = ?other, "Skipping hit without numeric id");
                        return None;
                    }
                };
                let source: Map<String, Value> = point
                    .payload
                    .into_iter()
                    .map(|(k, v)| (k, to_json(v)))
                    .collect();
                Some(KnnHit {
                    id,
                    score: point.score,
                    source,
                })
            })
            .collect();
        Ok(hits)
    }

    async fn count(&self, name: &str) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(name).exact(true))
            .await
            .map_err(|e| connection_error("count", e))?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DESCRIPTION_FIELD, NAME_FIELD, VECTOR_FIELD};

    #[test]
    fn test_distance_mapping() {
        assert_eq!(distance(Similarity::L2Norm), Distance::Euclid);
        assert_eq!(distance(Similarity::Cosine), Distance::Cosine);
        assert_eq!(distance(Similarity::DotProduct), Distance::Dot);
    }

    #[test]
    fn test_payload_values_convert_to_json() {
        let text = QdrantValue {
            kind: Some(Kind::StringValue("Linen Shirt".into())),
        };
        let number = QdrantValue {
            kind: Some(Kind::IntegerValue(1299)),
        };
        assert_eq!(to_json(text), Value::String("Linen Shirt".into()));
        assert_eq!(to_json(number), Value::from(1299));
        assert_eq!(to_json(QdrantValue { kind: None }), Value::Null);
    }

    #[test]
    fn test_point_keeps_knn_vector_out_of_payload() {
        let schema = IndexSchema::product_catalog(2).unwrap();
        let mut doc = Document::new(11);
        doc.insert(NAME_FIELD, FieldValue::Text("Scarf".into()));
        doc.insert(DESCRIPTION_FIELD, FieldValue::Text("Wool scarf".into()));
        doc.insert(VECTOR_FIELD, FieldValue::Vector(vec![0.5, 0.5]));

        let point = to_point(&schema, &doc);
        assert!(point.payload.contains_key(NAME_FIELD));
        assert!(!point.payload.contains_key(VECTOR_FIELD));
        assert!(point.vectors.is_some());
    }

    fn vector_params(size: u64, distance: Distance) -> VectorParams {
        VectorParams {
            size,
            distance: distance as i32,
            ..Default::default()
        }
    }

    fn catalog_spec() -> VectorSpec {
        VectorSpec {
            dims: 768,
            similarity: Similarity::L2Norm,
            indexed: true,
        }
    }

    #[test]
    fn test_existing_params_matching_spec_accepted() {
        let params = vector_params(768, Distance::Euclid);
        assert!(compare_vector_params("all_products", VECTOR_FIELD, Some(&params), catalog_spec()).is_ok());
    }

    #[test]
    fn test_existing_params_wrong_size_is_mismatch() {
        let params = vector_params(384, Distance::Euclid);
        let err = compare_vector_params("all_products", VECTOR_FIELD, Some(&params), catalog_spec())
            .unwrap_err();
        match err {
            Error::SchemaMismatch { index, reason } => {
                assert_eq!(index, "all_products");
                assert!(reason.contains("384"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_existing_params_wrong_distance_is_mismatch() {
        let params = vector_params(768, Distance::Cosine);
        let err = compare_vector_params("all_products", VECTOR_FIELD, Some(&params), catalog_spec())
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
    }

    #[test]
    fn test_existing_collection_without_named_vector_is_mismatch() {
        let err = compare_vector_params("all_products", VECTOR_FIELD, None, catalog_spec()).unwrap_err();
        match err {
            Error::SchemaMismatch { reason, .. } => assert!(reason.contains(VECTOR_FIELD)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_refused_point_rejects_only_that_document() {
        let err = QdrantError::ResponseError {
            status: tonic::Status::invalid_argument("payload too large"),
        };
        match upsert_error("all_products", 42, err) {
            Error::DocumentRejected { id, reason } => {
                assert_eq!(id, Some(42));
                assert_eq!(reason, "payload too large");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_upsert_transport_failure_is_connection_error() {
        let err = QdrantError::ResponseError {
            status: tonic::Status::unavailable("connection refused"),
        };
        assert!(matches!(upsert_error("all_products", 42, err), Error::Connection(_)));
    }

    #[test]
    fn test_upsert_into_missing_collection_is_index_not_found() {
        let err = QdrantError::ResponseError {
            status: tonic::Status::not_found("Collection all_products not found"),
        };
        assert!(matches!(
            upsert_error("all_products", 42, err),
            Error::IndexNotFound(name) if name == "all_products"
        ));
    }

    #[test]
    fn test_create_failure_classification() {
        let refused = QdrantError::ResponseError {
            status: tonic::Status::invalid_argument("bad vector size"),
        };
        assert!(matches!(create_error("all_products", refused), Error::InvalidSchema(_)));

        let unreachable = QdrantError::ResponseError {
            status: tonic::Status::unavailable("connection reset"),
        };
        assert!(matches!(create_error("all_products", unreachable), Error::Connection(_)));
    }

    #[test]
    fn test_default_config_points_at_local_grpc() {
        let config = QdrantIndexConfig::default();
        assert_eq!(config.url, "http://localhost:6334");
        assert!(config.api_key.is_none());
    }
}
