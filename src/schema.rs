//! Index schema and typed documents.
//!
//! The schema is the single source of truth for what a stored document looks
//! like: which fields exist, their types, and which dense-vector field takes
//! part in nearest-neighbor search. Both index backends validate documents
//! against it before storing them.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::catalog::RawRow;
use crate::error::{Error, Result};

/// Document key column.
pub const ID_FIELD: &str = "ProductID";
/// Display name column.
pub const NAME_FIELD: &str = "ProductName";
/// Free-text description column, the embedding source.
pub const DESCRIPTION_FIELD: &str = "Description";
/// Dense vector derived from the description.
pub const VECTOR_FIELD: &str = "DescriptionVector";

/// Distance function used to compare vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    /// Euclidean distance, smaller is closer.
    #[default]
    L2Norm,
    /// Cosine similarity, larger is closer.
    Cosine,
    /// Dot product, larger is closer.
    DotProduct,
}

impl Similarity {
    /// Parse the mapping name of a metric.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "l2_norm" => Ok(Similarity::L2Norm),
            "cosine" => Ok(Similarity::Cosine),
            "dot_product" => Ok(Similarity::DotProduct),
            other => Err(Error::InvalidSchema(format!(
                "unsupported similarity '{}'",
                other
            ))),
        }
    }

    /// Mapping name of the metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            Similarity::L2Norm => "l2_norm",
            Similarity::Cosine => "cosine",
            Similarity::DotProduct => "dot_product",
        }
    }

    /// Score two vectors of equal length under this metric.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Similarity::L2Norm => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Similarity::DotProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
            Similarity::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na * nb)
                }
            }
        }
    }

    /// True when lower scores mean closer vectors.
    pub fn is_distance(&self) -> bool {
        matches!(self, Similarity::L2Norm)
    }
}

/// Dense vector field parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSpec {
    /// Number of components.
    pub dims: usize,
    /// Comparison metric.
    pub similarity: Similarity,
    /// Whether the field is searchable by kNN, or only stored.
    pub indexed: bool,
}

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 64-bit signed integer.
    Long,
    /// Free text.
    Text,
    /// Fixed-length float vector.
    DenseVector(VectorSpec),
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
}

/// A stored field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Long(i64),
    Text(String),
    Vector(Vec<f32>),
}

impl FieldValue {
    /// JSON form of the value.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Long(v) => json!(v),
            FieldValue::Text(s) => json!(s),
            FieldValue::Vector(v) => json!(v),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            FieldValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

/// A typed document ready for storage, keyed by catalog identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: u64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    /// All fields as a JSON object, vectors included.
    pub fn to_source(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

/// Named collection of field declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    fields: Vec<FieldSpec>,
    id_field: String,
    source_field: String,
    knn: usize,
}

impl IndexSchema {
    /// Build a schema from field declarations.
    ///
    /// `id_field` must be a `Long` field and becomes the document key;
    /// `source_field` must be a `Text` field and is the embedding input.
    pub fn new(
        fields: Vec<FieldSpec>,
        id_field: impl Into<String>,
        source_field: impl Into<String>,
    ) -> Result<Self> {
        let mut schema = Self {
            fields,
            id_field: id_field.into(),
            source_field: source_field.into(),
            knn: 0,
        };
        schema.knn = schema.validate()?;
        Ok(schema)
    }

    /// The product catalog layout with a vector of `dims` components.
    pub fn product_catalog(dims: usize) -> Result<Self> {
        let text = |name: &str| FieldSpec {
            name: name.to_string(),
            field_type: FieldType::Text,
        };
        let long = |name: &str| FieldSpec {
            name: name.to_string(),
            field_type: FieldType::Long,
        };
        Self::new(
            vec![
                long(ID_FIELD),
                text(NAME_FIELD),
                text("ProductBrand"),
                text("Gender"),
                long("Price (INR)"),
                long("NumImages"),
                text(DESCRIPTION_FIELD),
                text("PrimaryColor"),
                FieldSpec {
                    name: VECTOR_FIELD.to_string(),
                    field_type: FieldType::DenseVector(VectorSpec {
                        dims,
                        similarity: Similarity::L2Norm,
                        indexed: true,
                    }),
                },
            ],
            ID_FIELD,
            DESCRIPTION_FIELD,
        )
    }

    /// Check structural soundness, returning the position of the kNN field.
    fn validate(&self) -> Result<usize> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(Error::InvalidSchema("field with empty name".into()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "field '{}' declared twice",
                    field.name
                )));
            }
            if let FieldType::DenseVector(spec) = field.field_type {
                if spec.dims == 0 {
                    return Err(Error::InvalidSchema(format!(
                        "vector field '{}' has zero dimensions",
                        field.name
                    )));
                }
            }
        }

        let indexed: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f.field_type, FieldType::DenseVector(s) if s.indexed))
            .map(|(i, _)| i)
            .collect();
        if indexed.len() != 1 {
            return Err(Error::InvalidSchema(format!(
                "expected exactly one indexed vector field, found {}",
                indexed.len()
            )));
        }

        match self.field_type(&self.id_field) {
            Some(FieldType::Long) => {}
            Some(_) => {
                return Err(Error::InvalidSchema(format!(
                    "id field '{}' must be long",
                    self.id_field
                )))
            }
            None => {
                return Err(Error::InvalidSchema(format!(
                    "id field '{}' is not declared",
                    self.id_field
                )))
            }
        }
        match self.field_type(&self.source_field) {
            Some(FieldType::Text) => Ok(indexed[0]),
            _ => Err(Error::InvalidSchema(format!(
                "embedding source '{}' must be a declared text field",
                self.source_field
            ))),
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn source_field(&self) -> &str {
        &self.source_field
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    /// Names of the scalar (non-vector) fields, in declaration order.
    pub fn scalar_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.field_type, FieldType::DenseVector(_)))
            .map(|f| f.name.as_str())
    }

    /// The vector field used for kNN search.
    pub fn knn_field(&self) -> (&str, VectorSpec) {
        let field = &self.fields[self.knn];
        match field.field_type {
            FieldType::DenseVector(spec) => (field.name.as_str(), spec),
            _ => unreachable!("kNN position always points at a vector field"),
        }
    }

    /// Parse an engine mapping body of the form
    /// `{"properties": {"Field": {"type": "long" | "text" | "dense_vector", ...}}}`.
    pub fn from_mapping(
        mapping: &Value,
        id_field: impl Into<String>,
        source_field: impl Into<String>,
    ) -> Result<Self> {
        let properties = mapping
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::InvalidSchema("mapping has no 'properties' object".into()))?;

        let mut fields = Vec::with_capacity(properties.len());
        for (name, decl) in properties {
            let kind = decl
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidSchema(format!("field '{}' has no type", name)))?;
            let field_type = match kind {
                "long" => FieldType::Long,
                "text" => FieldType::Text,
                "dense_vector" => {
                    let dims = decl.get("dims").and_then(Value::as_u64).ok_or_else(|| {
                        Error::InvalidSchema(format!("vector field '{}' has no dims", name))
                    })?;
                    let similarity = match decl.get("similarity").and_then(Value::as_str) {
                        Some(s) => Similarity::parse(s)?,
                        None => Similarity::default(),
                    };
                    let indexed = decl.get("index").and_then(Value::as_bool).unwrap_or(true);
                    FieldType::DenseVector(VectorSpec {
                        dims: dims as usize,
                        similarity,
                        indexed,
                    })
                }
                other => {
                    return Err(Error::InvalidSchema(format!(
                        "field '{}' has unsupported type '{}'",
                        name, other
                    )))
                }
            };
            fields.push(FieldSpec {
                name: name.clone(),
                field_type,
            });
        }
        Self::new(fields, id_field, source_field)
    }

    /// Render the schema as an engine mapping body.
    pub fn to_mapping(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let decl = match field.field_type {
                FieldType::Long => json!({ "type": "long" }),
                FieldType::Text => json!({ "type": "text" }),
                FieldType::DenseVector(spec) => json!({
                    "type": "dense_vector",
                    "dims": spec.dims,
                    "index": spec.indexed,
                    "similarity": spec.similarity.as_str(),
                }),
            };
            properties.insert(field.name.clone(), decl);
        }
        json!({ "properties": properties })
    }

    /// Turn a sentinel-filled row into a typed document.
    ///
    /// Vector fields are not read from the row; attach them afterwards with
    /// [`IndexSchema::attach_vector`].
    pub fn coerce(&self, row: &RawRow) -> Result<Document> {
        let raw_id = row.get(&self.id_field);
        let id = raw_id
            .and_then(|v| parse_long(v))
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| Error::DocumentRejected {
                id: None,
                reason: format!(
                    "identifier '{}' is not a non-negative integer: {:?}",
                    self.id_field, raw_id
                ),
            })?;

        let mut doc = Document::new(id);
        for field in &self.fields {
            let value = match field.field_type {
                FieldType::DenseVector(_) => continue,
                FieldType::Text => row.get(&field.name).map(|v| FieldValue::Text(v.to_string())),
                FieldType::Long => match row.get(&field.name) {
                    Some(v) => Some(FieldValue::Long(parse_long(v).ok_or_else(|| {
                        Error::DocumentRejected {
                            id: Some(id),
                            reason: format!("field '{}' expects long, got '{}'", field.name, v),
                        }
                    })?)),
                    None => None,
                },
            };
            let value = value.ok_or_else(|| Error::DocumentRejected {
                id: Some(id),
                reason: format!("field '{}' is absent", field.name),
            })?;
            doc.insert(field.name.clone(), value);
        }
        Ok(doc)
    }

    /// Attach `vector` to the kNN field after checking its dimension.
    pub fn attach_vector(&self, doc: &mut Document, vector: Vec<f32>) -> Result<()> {
        let (name, spec) = self.knn_field();
        if vector.len() != spec.dims {
            return Err(Error::DocumentRejected {
                id: Some(doc.id),
                reason: Error::DimensionMismatch {
                    expected: spec.dims,
                    actual: vector.len(),
                }
                .to_string(),
            });
        }
        doc.insert(name, FieldValue::Vector(vector));
        Ok(())
    }

    /// Check every declared field is present with a value of its type.
    pub fn validate_document(&self, doc: &Document) -> Result<()> {
        let reject = |reason: String| Error::DocumentRejected {
            id: Some(doc.id),
            reason,
        };
        for field in &self.fields {
            if let FieldType::DenseVector(spec) = field.field_type {
                if !spec.indexed && doc.get(&field.name).is_none() {
                    continue;
                }
            }
            let value = doc
                .get(&field.name)
                .ok_or_else(|| reject(format!("field '{}' is absent", field.name)))?;
            match (field.field_type, value) {
                (FieldType::Long, FieldValue::Long(_)) => {}
                (FieldType::Text, FieldValue::Text(_)) => {}
                (FieldType::DenseVector(spec), FieldValue::Vector(v)) => {
                    if v.len() != spec.dims {
                        return Err(reject(format!(
                            "field '{}': {}",
                            field.name,
                            Error::DimensionMismatch {
                                expected: spec.dims,
                                actual: v.len()
                            }
                        )));
                    }
                }
                (expected, _) => {
                    return Err(reject(format!(
                        "field '{}' does not match declared type {:?}",
                        field.name, expected
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Parse an integer, accepting integral floats such as `4999.0`.
fn parse_long(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let f = raw.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
