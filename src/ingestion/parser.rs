use thiserror::Error;

use crate::storage::data::NewRecord;

/// Errors that can occur during parsing
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Invalid input format: {0}")]
    InvalidFormat(String),
    #[error("Row {row}: missing required field {field}")]
    MissingField { row: usize, field: String },
    #[error("Row {row}: invalid field {field}: {reason}")]
    InvalidField {
        row: usize,
        field: String,
        reason: String,
    },
    #[error("Batch processing error: {0}")]
    BatchError(String),
}

/// Result type for parser operations
pub type ParserResult<T> = Result<T, ParserError>;

/// Trait for parsing input rows into records
pub trait Parser: Send + Sync {
    /// Parses a single input into a vector of records
    fn parse(&self, input: &[u8]) -> ParserResult<Vec<NewRecord>>;

    /// Parses several inputs, failing with every per-input error at once
    fn parse_batch(&self, inputs: &[&[u8]]) -> ParserResult<Vec<NewRecord>> {
        let mut results = Vec::new();
        let mut errors = Vec::new();

        for (i, input) in inputs.iter().enumerate() {
            match self.parse(input) {
                Ok(records) => results.extend(records),
                Err(e) => errors.push(format!("input {}: {}", i, e)),
            }
        }

        if !errors.is_empty() {
            return Err(ParserError::BatchError(errors.join("; ")));
        }
        Ok(results)
    }

    /// Returns the format names this parser accepts
    fn supported_formats(&self) -> &'static [&'static str];
}

/// Normalizes a raw location cell: empty or `null`-like values mean absent
pub(crate) fn parse_location(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedParser;

    impl Parser for FixedParser {
        fn parse(&self, input: &[u8]) -> ParserResult<Vec<NewRecord>> {
            match input {
                b"ok" => Ok(vec![NewRecord::new("ili", 201501, None, 1.0)]),
                _ => Err(ParserError::InvalidFormat("not ok".to_string())),
            }
        }

        fn supported_formats(&self) -> &'static [&'static str] {
            &["fixed"]
        }
    }

    #[test]
    fn test_parse_batch_collects_records() {
        let records = FixedParser.parse_batch(&[&b"ok"[..], &b"ok"[..]]).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_parse_batch_reports_failing_inputs() {
        let err = FixedParser.parse_batch(&[&b"ok"[..], &b"bad"[..], &b"worse"[..]]).unwrap_err();
        let ParserError::BatchError(message) = err else {
            panic!("expected a batch error");
        };
        assert!(message.contains("input 1"));
        assert!(message.contains("input 2"));
        assert!(!message.contains("input 0"));
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location(Some(" US ")), Some("US".to_string()));
        assert_eq!(parse_location(Some("")), None);
        assert_eq!(parse_location(Some("NULL")), None);
        assert_eq!(parse_location(None), None);
    }
}
