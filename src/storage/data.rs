use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a target name, in characters
pub const MAX_TARGET_LEN: usize = 32;
/// Maximum length of a location code, in characters
pub const MAX_LOCATION_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
    #[error("Invalid location: {0}")]
    InvalidLocation(String),
    #[error("Invalid value: {0}")]
    InvalidValue(f64),
}

/// Surrogate identifier assigned by the store
pub type RecordId = u64;

/// The composite unique key of a record.
///
/// Ordering is by target, then epiweek, then location, with an absent
/// location sorting before any present one. Indexes rely on this to yield a
/// target's records in epiweek order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub target: String,
    pub epiweek: i32,
    pub location: Option<String>,
}

impl RecordKey {
    pub fn new(target: impl Into<String>, epiweek: i32, location: Option<&str>) -> Self {
        Self {
            target: target.into(),
            epiweek,
            location: location.map(str::to_string),
        }
    }

    /// Validates the key fields against the column constraints
    pub fn validate(&self) -> Result<(), DataError> {
        if self.target.is_empty() {
            return Err(DataError::InvalidTarget(
                "Target cannot be empty".to_string(),
            ));
        }
        if self.target.chars().count() > MAX_TARGET_LEN {
            return Err(DataError::InvalidTarget(format!(
                "Target {:?} exceeds {} characters",
                self.target, MAX_TARGET_LEN
            )));
        }
        if let Some(location) = &self.location {
            if location.chars().count() > MAX_LOCATION_LEN {
                return Err(DataError::InvalidLocation(format!(
                    "Location {:?} exceeds {} characters",
                    location, MAX_LOCATION_LEN
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "({}, {}, {})", self.target, self.epiweek, location),
            None => write!(f, "({}, {}, NULL)", self.target, self.epiweek),
        }
    }
}

/// Caller-supplied fields of a record, before an id is assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub target: String,
    pub epiweek: i32,
    #[serde(default)]
    pub location: Option<String>,
    pub value: f64,
}

impl NewRecord {
    pub fn new(target: impl Into<String>, epiweek: i32, location: Option<&str>, value: f64) -> Self {
        Self {
            target: target.into(),
            epiweek,
            location: location.map(str::to_string),
            value,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            target: self.target.clone(),
            epiweek: self.epiweek,
            location: self.location.clone(),
        }
    }

    /// Validates all caller-supplied fields
    pub fn validate(&self) -> Result<(), DataError> {
        self.key().validate()?;
        if !self.value.is_finite() {
            return Err(DataError::InvalidValue(self.value));
        }
        Ok(())
    }
}

/// A stored target value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    key: RecordKey,
    value: f64,
}

impl Record {
    pub(crate) fn new(id: RecordId, key: RecordKey, value: f64) -> Self {
        Self { id, key, value }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn target(&self) -> &str {
        &self.key.target
    }

    pub fn epiweek(&self) -> i32 {
        self.key.epiweek
    }

    pub fn location(&self) -> Option<&str> {
        self.key.location.as_deref()
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
