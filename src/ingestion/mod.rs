//! Ingestion module for tvdb
//! Turns JSON or CSV target rows into validated records and upserts them.

pub mod formats;
pub mod parser;
pub mod registry;
pub mod validation;

use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Database, DatabaseError};
use crate::metrics;
use crate::storage::data::NewRecord;
use parser::ParserError;
use registry::{ParserRegistry, RegistryError};
use validation::{ValidationConfig, ValidationError, ValidationMiddleware};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error(transparent)]
    Parser(#[from] ParserError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Outcome of an ingestion run
#[derive(Debug, Default)]
pub struct IngestReport {
    pub parsed: usize,
    pub inserted: usize,
    pub replaced: usize,
    /// Rows that failed validation, by position in the input
    pub rejected: Vec<(usize, ValidationError)>,
}

/// Parses, validates and upserts batches of target values
#[derive(Default)]
pub struct Ingestor {
    registry: ParserRegistry,
    validator: ValidationMiddleware,
}

impl Ingestor {
    pub fn new(registry: ParserRegistry, validator: ValidationMiddleware) -> Self {
        Self {
            registry,
            validator,
        }
    }

    /// An ingestor with the built-in parsers and the given validation rules
    pub fn with_config(config: ValidationConfig) -> Self {
        Self::new(
            ParserRegistry::with_defaults(),
            ValidationMiddleware::with_config(config),
        )
    }

    /// Parses and validates `input`, splitting it into accepted records and
    /// rejected rows
    pub fn prepare(
        &self,
        format: Option<&str>,
        input: &[u8],
    ) -> Result<(Vec<NewRecord>, Vec<(usize, ValidationError)>), IngestError> {
        let parsed = match format {
            Some(format) => self.registry.get_parser(format)?.parse(input)?,
            None => self.registry.parse_with_autodiscovery(input)?,
        };

        let mut accepted = Vec::with_capacity(parsed.len());
        let mut rejected = Vec::new();
        for (row, record) in parsed.into_iter().enumerate() {
            match self.validator.validate(record) {
                Ok(record) => accepted.push(record),
                Err(e) => {
                    warn!("Rejected row {}: {}", row, e);
                    rejected.push((row, e));
                }
            }
        }
        Ok((accepted, rejected))
    }

    /// Upserts every valid row of `input`; later rows win over earlier rows
    /// with the same key
    pub async fn ingest(
        &self,
        db: &Database,
        format: Option<&str>,
        input: &[u8],
    ) -> Result<IngestReport, IngestError> {
        let (accepted, rejected) = self.prepare(format, input)?;
        let parsed = accepted.len() + rejected.len();
        let summary = db.upsert_batch(accepted).await?;

        metrics::record_ingestion(summary.inserted, summary.replaced, rejected.len());
        info!(
            "Ingested target values: parsed={}, inserted={}, replaced={}, rejected={}",
            parsed,
            summary.inserted,
            summary.replaced,
            rejected.len()
        );
        Ok(IngestReport {
            parsed,
            inserted: summary.inserted,
            replaced: summary.replaced,
            rejected,
        })
    }

    /// Ingests a file; without an explicit format, the extension picks the
    /// parser and unknown extensions fall back to autodiscovery
    pub async fn ingest_file(
        &self,
        db: &Database,
        path: &Path,
        format: Option<&str>,
    ) -> Result<IngestReport, IngestError> {
        let input = tokio::fs::read(path)
            .await
            .map_err(|e| IngestError::Io(path.display().to_string(), e))?;

        let format = match format {
            Some(format) => Some(format.to_string()),
            None => path
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|_| self.registry.parser_for_path(path).is_ok())
                .map(str::to_string),
        };
        self.ingest(db, format.as_deref(), &input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use tempfile::tempdir;
    use tokio::test;

    #[test]
    async fn test_ingest_json_with_rejections() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("wal"), &WalConfig::default()).unwrap();
        let ingestor = Ingestor::default();

        let input = br#"[
            {"target": "datasetname_rate", "epiweek": 201740, "location": "CA", "value": 1.5},
            {"target": "datasetname_rate", "epiweek": 201741, "location": "CA", "value": 2.5},
            {"target": "datasetname_rate", "epiweek": 201799, "location": "CA", "value": 3.5},
            {"target": "datasetname_rate", "epiweek": 201740, "location": "ca", "value": 4.5}
        ]"#;
        let report = ingestor.ingest(&db, Some("json"), input).await.unwrap();

        assert_eq!(report.parsed, 4);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.replaced, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, 2);

        let record = db.store().get("datasetname_rate", 201740, Some("ca")).unwrap();
        assert_eq!(record.value(), 4.5);
        assert_eq!(db.store().scan_by_location("ca").count(), 2);
    }

    #[test]
    async fn test_ingest_file_by_extension() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("wal"), &WalConfig::default()).unwrap();
        let path = dir.path().join("targets.csv");
        std::fs::write(&path, "target,epiweek,location,value\nili,201501,US,2.5\nili,201502,,3.0\n").unwrap();

        let report = Ingestor::default().ingest_file(&db, &path, None).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert!(db.store().get("ili", 201501, Some("us")).is_ok());
        assert!(db.store().get("ili", 201502, None).is_ok());
    }

    #[test]
    async fn test_ingest_unknown_extension_autodiscovers() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("wal"), &WalConfig::default()).unwrap();
        let path = dir.path().join("targets.txt");
        std::fs::write(&path, r#"{"target": "ili", "epiweek": 201501, "value": 2.5}"#).unwrap();

        let report = Ingestor::default().ingest_file(&db, &path, None).await.unwrap();
        assert_eq!(report.inserted, 1);
    }

    #[test]
    async fn test_ingest_missing_file() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("wal"), &WalConfig::default()).unwrap();
        let result = Ingestor::default()
            .ingest_file(&db, &dir.path().join("missing.json"), None)
            .await;
        assert!(matches!(result, Err(IngestError::Io(_, _))));
    }
}
