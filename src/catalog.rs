//! Catalog source: tabular rows read from CSV.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Placeholder written in place of a missing cell.
pub const DEFAULT_SENTINEL: &str = "None";

/// Rows ingested when no limit is configured explicitly.
pub const DEFAULT_ROW_LIMIT: usize = 100;

/// Cell contents treated as missing, in addition to blank cells.
const NA_TOKENS: &[&str] = &["NA", "N/A", "n/a", "NaN", "nan", "null", "NULL", "None", "<NA>"];

/// One raw catalog row. Every cell is text; `None` marks a missing value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    values: BTreeMap<String, Option<String>>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row where every listed column is present.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        }
    }

    /// Set a cell, `None` meaning missing.
    pub fn set(&mut self, column: impl Into<String>, value: Option<String>) {
        self.values.insert(column.into(), value);
    }

    /// Present value of a cell.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    pub fn is_missing(&self, column: &str) -> bool {
        self.get(column).is_none()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Replace every missing value with `sentinel`.
    ///
    /// Covers both the columns the row carries and every column in
    /// `expected`, so a short row ends up with the full field set. Returns the
    /// number of cells filled.
    pub fn fill_missing<'a>(
        &mut self,
        sentinel: &str,
        expected: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        for column in expected {
            self.values.entry(column.to_string()).or_insert(None);
        }
        let mut filled = 0;
        for value in self.values.values_mut() {
            if value.is_none() {
                *value = Some(sentinel.to_string());
                filled += 1;
            }
        }
        filled
    }
}

/// Reads catalog rows from a CSV file with a header line.
#[derive(Debug, Clone)]
pub struct CatalogReader {
    path: PathBuf,
    row_limit: Option<usize>,
    delimiter: u8,
}

impl CatalogReader {
    /// Reader over `path` with the default row limit.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            row_limit: Some(DEFAULT_ROW_LIMIT),
            delimiter: b',',
        }
    }

    /// Only read the first `limit` data rows; `None` reads everything.
    pub fn with_row_limit(mut self, limit: Option<usize>) -> Self {
        self.row_limit = limit;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read rows from the configured file.
    pub fn read(&self) -> Result<Vec<RawRow>> {
        let file = File::open(&self.path).map_err(|e| {
            Error::Catalog(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        let rows = self.parse(file)?;
        info!(
            path = %self.path.display(),
            rows = rows.len(),
            limit = ?self.row_limit,
            "Loaded catalog rows"
        );
        Ok(rows)
    }

    /// Parse rows from any reader.
    pub fn parse<R: Read>(&self, reader: R) -> Result<Vec<RawRow>> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();

        let limit = self.row_limit.unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        for (row_idx, record) in csv_reader.byte_records().take(limit).enumerate() {
            let record = record.map_err(|e| Error::Catalog(format!("row {}: {}", row_idx + 1, e)))?;
            let mut row = RawRow::new();
            let mut replaced = Vec::new();
            for (idx, column) in headers.iter().enumerate() {
                let value = record.get(idx).map(|bytes| match std::str::from_utf8(bytes) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        replaced.push(column.as_str());
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                });
                let value = value.map(|v| v.trim().to_string()).filter(|v| !is_na(v));
                row.set(column.clone(), value);
            }
            if !replaced.is_empty() {
                warn!(
                    row = row_idx + 1,
                    columns = ?replaced,
                    "Invalid UTF-8 replaced in catalog row"
                );
                metrics::counter!("catalog_search_rows_lossy_decoded_total").increment(1);
            }
            if record.len() > headers.len() {
                debug!(row = row_idx + 1, "Ignoring cells beyond the header width");
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

fn is_na(cell: &str) -> bool {
    cell.is_empty() || NA_TOKENS.contains(&cell)
}
