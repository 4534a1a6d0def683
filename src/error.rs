//! Error types for catalog search.

use thiserror::Error;

/// Crate-wide error type.
///
/// Variants map onto how far a failure is allowed to travel: `DocumentRejected`
/// and `MissingField` are contained to one record or one displayed field, the
/// rest halt the operation in progress.
#[derive(Debug, Error)]
pub enum Error {
    /// The index engine could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The index schema is malformed.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// The index already exists with a different vector layout.
    #[error("Index '{index}' exists with an incompatible schema: {reason}")]
    SchemaMismatch { index: String, reason: String },

    /// The named index has not been created.
    #[error("Index '{0}' does not exist")]
    IndexNotFound(String),

    /// A single document was refused by the schema or the engine.
    #[error("Document {} rejected: {reason}", display_id(.id))]
    DocumentRejected { id: Option<u64>, reason: String },

    /// The embedding model failed to process its input.
    #[error("Model inference error: {0}")]
    ModelInference(String),

    /// A field expected on a search hit was not present.
    #[error("Missing field '{0}'")]
    MissingField(String),

    /// Search parameters are out of range.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A vector does not have the dimension the schema declares.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The catalog source could not be read.
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn display_id(id: &Option<u64>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "<no id>".to_string())
}

impl Error {
    /// Whether the failure is confined to a single unit of work.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DocumentRejected { .. } | Error::MissingField(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Catalog(err.to_string())
    }
}

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;
