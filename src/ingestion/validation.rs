use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::storage::data::{DataError, NewRecord};
use crate::storage::epiweek::{Epiweek, EpiweekError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Value sanity check failed: {0}")]
    ValueSanityCheck(String),
    #[error("Unknown location: {0}")]
    UnknownLocation(String),
    #[error("Epiweek validation error: {0}")]
    Epiweek(#[from] EpiweekError),
    #[error("Data validation error: {0}")]
    DataError(#[from] DataError),
}

/// Configuration for validation middleware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Lower-case locations before storing them
    pub lowercase_locations: bool,
    /// Reject epiweeks that are not valid MMWR weeks
    pub strict_epiweeks: bool,
    /// Maximum allowed value (for sanity checking)
    pub max_value: Option<f64>,
    /// Minimum allowed value (for sanity checking)
    pub min_value: Option<f64>,
    /// If non-empty, the only locations accepted (compared after lower-casing)
    pub allowed_locations: BTreeSet<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            lowercase_locations: true,
            strict_epiweeks: true,
            max_value: None,
            min_value: None,
            allowed_locations: BTreeSet::new(),
        }
    }
}

impl ValidationConfig {
    /// Applies the same location normalization ingestion uses, so lookups
    /// find what was imported
    pub fn normalize_location(&self, location: &str) -> String {
        if self.lowercase_locations {
            location.to_lowercase()
        } else {
            location.to_string()
        }
    }
}

/// Normalizes and checks parsed records before they reach the store
#[derive(Debug, Clone, Default)]
pub struct ValidationMiddleware {
    config: ValidationConfig,
}

impl ValidationMiddleware {
    /// Creates a new validation middleware with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new validation middleware with custom configuration
    pub fn with_config(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Normalizes a record and validates it against the configured rules
    pub fn validate(&self, mut record: NewRecord) -> Result<NewRecord, ValidationError> {
        record.location = record
            .location
            .map(|location| self.config.normalize_location(&location));

        record.validate()?;

        if self.config.strict_epiweeks {
            Epiweek::try_from(record.epiweek)?;
        }

        if let Some(max) = self.config.max_value {
            if record.value > max {
                return Err(ValidationError::ValueSanityCheck(format!(
                    "Value {} exceeds maximum allowed value {}",
                    record.value, max
                )));
            }
        }
        if let Some(min) = self.config.min_value {
            if record.value < min {
                return Err(ValidationError::ValueSanityCheck(format!(
                    "Value {} is below minimum allowed value {}",
                    record.value, min
                )));
            }
        }

        if let Some(location) = &record.location {
            let allowed = &self.config.allowed_locations;
            if !allowed.is_empty() && !allowed.contains(&location.to_lowercase()) {
                return Err(ValidationError::UnknownLocation(location.clone()));
            }
        }

        Ok(record)
    }
}
