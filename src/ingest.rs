//! Ingestion pipeline: raw catalog rows to vector-annotated documents.
//!
//! Each row is sentinel-filled, typed against the schema, given an embedding
//! of its description, and upserted by catalog identifier. A record the
//! schema or the engine refuses is reported and skipped; connection and
//! schema failures stop the run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{RawRow, DEFAULT_SENTINEL};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::schema::{Document, IndexSchema};
use crate::search::{Embedder, Embedding};

/// What to do when the embedding model fails on a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceFailurePolicy {
    /// Stop the run and return the error.
    #[default]
    Abort,
    /// Skip the record and keep going.
    Skip,
}

/// Tunables for [`IngestionPipeline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Value substituted for every missing cell.
    pub sentinel: String,
    /// Descriptions embedded per model call.
    pub batch_size: usize,
    pub on_inference_error: InferenceFailurePolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            batch_size: 32,
            on_inference_error: InferenceFailurePolicy::Abort,
        }
    }
}

/// A record that did not make it into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    /// Zero-based position in the input batch.
    pub row: usize,
    pub id: Option<u64>,
    pub reason: String,
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Rows received.
    pub processed: usize,
    /// Upserts accepted by the index.
    pub indexed: usize,
    /// Records refused by the schema or the engine.
    pub rejected: Vec<RejectedRecord>,
    /// Records skipped because the model failed on them.
    pub inference_failures: Vec<RejectedRecord>,
}

impl IngestReport {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    /// True when every row was stored.
    pub fn is_complete(&self) -> bool {
        self.indexed == self.processed
    }
}

/// A row that passed typing and is waiting for its vector.
struct Pending {
    row: usize,
    doc: Document,
    text: String,
}

/// Turns catalog rows into indexed documents.
pub struct IngestionPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    index_name: String,
    schema: IndexSchema,
    options: IngestOptions,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        index_name: impl Into<String>,
        schema: IndexSchema,
    ) -> Self {
        Self {
            embedder,
            index,
            index_name: index_name.into(),
            schema,
            options: IngestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: IngestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Ingest `rows` in order.
    ///
    /// Upserts are keyed by identifier, so rerunning with the same rows
    /// leaves the index unchanged and a repeated id within a batch resolves
    /// to its last row. An empty batch does nothing.
    pub async fn ingest(&self, rows: Vec<RawRow>) -> Result<IngestReport> {
        let mut report = IngestReport {
            processed: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            debug!(index = %self.index_name, "Empty batch, nothing to ingest");
            return Ok(report);
        }

        let columns: Vec<&str> = self.schema.scalar_fields().collect();
        let mut pending = Vec::with_capacity(rows.len());
        for (row_idx, mut row) in rows.into_iter().enumerate() {
            let filled = row.fill_missing(&self.options.sentinel, columns.iter().copied());
            if filled > 0 {
                debug!(row = row_idx, filled, "Filled missing cells with sentinel");
            }
            match self.schema.coerce(&row) {
                Ok(doc) => {
                    let text = row
                        .get(self.schema.source_field())
                        .unwrap_or(self.options.sentinel.as_str())
                        .to_string();
                    pending.push(Pending {
                        row: row_idx,
                        doc,
                        text,
                    });
                }
                Err(err) => self.reject(&mut report, row_idx, err)?,
            }
        }

        for chunk in pending.chunks(self.options.batch_size.max(1)) {
            let vectors = self.embed_chunk(chunk, &mut report).await?;
            for (item, vector) in chunk.iter().zip(vectors) {
                let Some(vector) = vector else { continue };
                let mut doc = item.doc.clone();
                if let Err(err) = self.schema.attach_vector(&mut doc, vector) {
                    self.reject(&mut report, item.row, err)?;
                    continue;
                }
                match self.index.upsert(&self.index_name, &doc).await {
                    Ok(()) => {
                        report.indexed += 1;
                        metrics::counter!("catalog_search_documents_indexed_total").increment(1);
                    }
                    Err(err) => self.reject(&mut report, item.row, err)?,
                }
            }
        }

        info!(
            index = %self.index_name,
            processed = report.processed,
            indexed = report.indexed,
            rejected = report.rejected.len(),
            inference_failures = report.inference_failures.len(),
            "Ingestion finished"
        );
        Ok(report)
    }

    /// Record a per-document failure, or pass anything else up.
    fn reject(&self, report: &mut IngestReport, row: usize, err: Error) -> Result<()> {
        match err {
            Error::DocumentRejected { id, reason } => {
                warn!(row, id = ?id, %reason, "Document rejected");
                metrics::counter!("catalog_search_documents_rejected_total").increment(1);
                report.rejected.push(RejectedRecord { row, id, reason });
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Embed one chunk. `None` marks a record skipped under the skip policy.
    async fn embed_chunk(
        &self,
        chunk: &[Pending],
        report: &mut IngestReport,
    ) -> Result<Vec<Option<Embedding>>> {
        let texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
        match self.embed_texts(texts).await {
            Ok(vectors) => return Ok(vectors.into_iter().map(Some).collect()),
            Err(err) if self.options.on_inference_error == InferenceFailurePolicy::Abort => {
                return Err(err)
            }
            Err(err) => {
                debug!(error = %err, "Batch inference failed, retrying records one by one");
            }
        }

        let mut vectors = Vec::with_capacity(chunk.len());
        for item in chunk {
            match self.embed_texts(vec![item.text.clone()]).await {
                Ok(mut v) => vectors.push(v.pop()),
                Err(err @ Error::ModelInference(_)) => {
                    warn!(row = item.row, id = item.doc.id, error = %err, "Skipping record");
                    report.inference_failures.push(RejectedRecord {
                        row: item.row,
                        id: Some(item.doc.id),
                        reason: err.to_string(),
                    });
                    vectors.push(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(vectors)
    }

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
            .await
            .map_err(|e| Error::ModelInference(format!("embedding task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{KnnQuery, MemoryIndex};
    use crate::schema::{FieldValue, DESCRIPTION_FIELD, NAME_FIELD, VECTOR_FIELD};
    use crate::search::HashingEmbedder;

    const IDX: &str = "all_products";
    const DIMS: usize = 16;

    fn row(id: &str, name: &str, price: &str, description: Option<&str>) -> RawRow {
        let mut row = RawRow::from_pairs([
            ("ProductID", id),
            ("ProductName", name),
            ("ProductBrand", "Acme"),
            ("Gender", "Unisex"),
            ("Price (INR)", price),
            ("NumImages", "4"),
            ("PrimaryColor", "Black"),
        ]);
        row.set(DESCRIPTION_FIELD, description.map(String::from));
        row
    }

    async fn pipeline() -> (Arc<MemoryIndex>, IngestionPipeline) {
        let schema = IndexSchema::product_catalog(DIMS).unwrap();
        let index = Arc::new(MemoryIndex::new());
        index.ensure_index(IDX, &schema).await.unwrap();
        let pipeline = IngestionPipeline::new(
            Arc::new(HashingEmbedder::new(DIMS)),
            index.clone(),
            IDX,
            schema,
        );
        (index, pipeline)
    }

    /// Fails on any text containing "poison".
    struct PickyEmbedder(HashingEmbedder);

    impl Embedder for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }

        fn dimension(&self) -> usize {
            self.0.dimension()
        }

        fn embed(&self, text: &str) -> Result<Embedding> {
            if text.contains("poison") {
                return Err(Error::ModelInference("cannot encode input".into()));
            }
            self.0.embed(text)
        }
    }

    #[tokio::test]
    async fn test_null_description_gets_sentinel_and_its_embedding() {
        let (index, pipeline) = pipeline().await;
        let rows = vec![
            row("1", "Scarf", "499", Some("soft wool scarf")),
            row("2", "Tie", "299", None),
            row("3", "Belt", "799", Some("brown leather belt")),
        ];
        let report = pipeline.ingest(rows).await.unwrap();
        assert_eq!(report.indexed, 3);
        assert!(report.is_complete());

        let stored = index.get(IDX, 2).await.unwrap();
        assert_eq!(
            stored.get(DESCRIPTION_FIELD).and_then(FieldValue::as_text),
            Some(DEFAULT_SENTINEL)
        );
        let expected = HashingEmbedder::new(DIMS).embed(DEFAULT_SENTINEL).unwrap();
        assert_eq!(
            stored.get(VECTOR_FIELD).and_then(FieldValue::as_vector),
            Some(expected.as_slice())
        );
    }

    #[tokio::test]
    async fn test_missing_text_columns_are_filled() {
        let (index, pipeline) = pipeline().await;
        let mut sparse = RawRow::from_pairs([
            ("ProductID", "5"),
            ("Price (INR)", "100"),
            ("NumImages", "1"),
        ]);
        sparse.set("PrimaryColor", None);
        pipeline.ingest(vec![sparse]).await.unwrap();

        let stored = index.get(IDX, 5).await.unwrap();
        for field in [NAME_FIELD, "ProductBrand", "Gender", "PrimaryColor", DESCRIPTION_FIELD] {
            assert_eq!(
                stored.get(field).and_then(FieldValue::as_text),
                Some(DEFAULT_SENTINEL),
                "field {field} should hold the sentinel"
            );
        }
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (index, pipeline) = pipeline().await;
        let rows = || {
            vec![
                row("1", "Scarf", "499", Some("wool scarf")),
                row("2", "Tie", "299", Some("silk tie")),
            ]
        };
        pipeline.ingest(rows()).await.unwrap();
        pipeline.ingest(rows()).await.unwrap();
        assert_eq!(index.count(IDX).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_last_write_wins() {
        let (index, pipeline) = pipeline().await;
        let rows = vec![
            row("7", "First", "100", Some("first version")),
            row("7", "Second", "200", Some("second version")),
        ];
        let report = pipeline.ingest(rows).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(index.count(IDX).await.unwrap(), 1);
        let stored = index.get(IDX, 7).await.unwrap();
        assert_eq!(stored.get(NAME_FIELD).and_then(FieldValue::as_text), Some("Second"));
    }

    #[tokio::test]
    async fn test_malformed_price_is_skipped_and_batch_continues() {
        let (index, pipeline) = pipeline().await;
        let rows = vec![
            row("1", "Scarf", "499", Some("wool scarf")),
            row("2", "Tie", "two hundred", Some("silk tie")),
            row("3", "Belt", "799", Some("leather belt")),
        ];
        let report = pipeline.ingest(rows).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.rejected_count(), 1);
        assert_eq!(report.rejected[0].row, 1);
        assert_eq!(report.rejected[0].id, Some(2));
        assert!(index.get(IDX, 1).await.is_some());
        assert!(index.get(IDX, 2).await.is_none());
        assert!(index.get(IDX, 3).await.is_some());
    }

    #[tokio::test]
    async fn test_missing_price_becomes_sentinel_and_is_rejected() {
        let (index, pipeline) = pipeline().await;
        let mut bad = row("4", "Cap", "0", Some("cotton cap"));
        bad.set("Price (INR)", None);
        let report = pipeline.ingest(vec![bad]).await.unwrap();
        assert_eq!(report.rejected_count(), 1);
        assert!(report.rejected[0].reason.contains("None"));
        assert_eq!(index.count(IDX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (index, pipeline) = pipeline().await;
        let report = pipeline.ingest(Vec::new()).await.unwrap();
        assert_eq!(report, IngestReport::default());
        assert_eq!(index.count(IDX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_aborts_by_default() {
        let schema = IndexSchema::product_catalog(DIMS).unwrap();
        let index = Arc::new(MemoryIndex::new());
        index.ensure_index(IDX, &schema).await.unwrap();
        let pipeline = IngestionPipeline::new(
            Arc::new(PickyEmbedder(HashingEmbedder::new(DIMS))),
            index,
            IDX,
            schema,
        );
        let err = pipeline
            .ingest(vec![row("1", "Odd", "1", Some("poison pill"))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelInference(_)));
    }

    #[tokio::test]
    async fn test_inference_failure_skips_only_failing_record() {
        let schema = IndexSchema::product_catalog(DIMS).unwrap();
        let index = Arc::new(MemoryIndex::new());
        index.ensure_index(IDX, &schema).await.unwrap();
        let pipeline = IngestionPipeline::new(
            Arc::new(PickyEmbedder(HashingEmbedder::new(DIMS))),
            index.clone(),
            IDX,
            schema,
        )
        .with_options(IngestOptions {
            on_inference_error: InferenceFailurePolicy::Skip,
            ..Default::default()
        });

        let report = pipeline
            .ingest(vec![
                row("1", "Scarf", "499", Some("wool scarf")),
                row("2", "Odd", "1", Some("poison pill")),
                row("3", "Belt", "799", Some("leather belt")),
            ])
            .await
            .unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.inference_failures.len(), 1);
        assert_eq!(report.inference_failures[0].id, Some(2));
        assert!(index.get(IDX, 2).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_index_halts_ingestion() {
        let schema = IndexSchema::product_catalog(DIMS).unwrap();
        let pipeline = IngestionPipeline::new(
            Arc::new(HashingEmbedder::new(DIMS)),
            Arc::new(MemoryIndex::new()),
            IDX,
            schema,
        );
        let err = pipeline
            .ingest(vec![row("1", "Scarf", "499", Some("wool scarf"))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(_)));
    }

    #[tokio::test]
    async fn test_ingested_documents_are_searchable() {
        let (index, pipeline) = pipeline().await;
        pipeline
            .ingest(vec![
                row("1", "Scarf", "499", Some("wool scarf")),
                row("2", "Tie", "299", Some("silk tie")),
            ])
            .await
            .unwrap();
        let vector = HashingEmbedder::new(DIMS).embed("silk tie").unwrap();
        let hits = index
            .knn_search(
                IDX,
                &KnnQuery {
                    field: VECTOR_FIELD.into(),
                    vector,
                    k: 1,
                    num_candidates: 10,
                    source: vec![NAME_FIELD.into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(hits[0].id, 2);
    }
}
