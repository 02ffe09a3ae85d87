//! Input extract loader.
//!
//! The extract is a delimited file with a header row and the columns
//! `account`, `entity`, `month` (YYYYMM) and `sales`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::DataException;
use crate::types::{AccountName, EntityKey, Month};

#[derive(Debug, Deserialize)]
struct RawRecord {
    account: String,
    entity: String,
    month: String,
    sales: f64,
}

/// One validated extract row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractRecord {
    pub account: AccountName,
    pub entity: EntityKey,
    pub month: Month,
    pub sales: f64,
}

#[derive(Debug, Clone)]
pub struct DataLoader {
    path: PathBuf,
    delimiter: u8,
}

impl DataLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate all rows of the extract.
    pub fn load(&self) -> Result<Vec<ExtractRecord>, DataException> {
        if !self.path.is_file() {
            return Err(DataException::MissingExtract(self.path.display().to_string()));
        }
        info!("Loading input extract from {}", self.path.display());

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| DataException::MissingExtract(format!("{}: {e}", self.path.display())))?;

        let headers = reader
            .headers()
            .map_err(|e| DataException::Malformed {
                line: 1,
                reason: e.to_string(),
            })?
            .clone();

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| DataException::Malformed {
                line: e.position().map(|p| p.line()).unwrap_or(0),
                reason: e.to_string(),
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let raw: RawRecord = record
                .deserialize(Some(&headers))
                .map_err(|e| DataException::Malformed {
                    line,
                    reason: e.to_string(),
                })?;
            records.push(validate(raw, line)?);
        }

        if records.is_empty() {
            return Err(DataException::Empty(self.path.display().to_string()));
        }
        debug!(rows = records.len(), "Loaded input extract");
        Ok(records)
    }
}

fn validate(raw: RawRecord, line: u64) -> Result<ExtractRecord, DataException> {
    let malformed = |reason: String| DataException::Malformed { line, reason };

    if raw.account.is_empty() {
        return Err(malformed("empty account".to_string()));
    }
    if raw.entity.is_empty() {
        return Err(malformed("empty entity".to_string()));
    }
    if !raw.sales.is_finite() {
        return Err(malformed(format!("sales value {} is not finite", raw.sales)));
    }
    let month = Month::parse(&raw.month).map_err(|e| malformed(e.to_string()))?;

    Ok(ExtractRecord {
        account: AccountName::new(raw.account),
        entity: EntityKey::new(raw.entity),
        month,
        sales: raw.sales,
    })
}
