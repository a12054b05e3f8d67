use csv::{ReaderBuilder, StringRecord, Trim};
use serde_json::{Map, Value};

use super::parser::{parse_location, Parser, ParserError, ParserResult};
use crate::storage::data::NewRecord;

/// Names of the input fields holding each record column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub target: String,
    pub epiweek: String,
    pub location: String,
    pub value: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            target: "target".to_string(),
            epiweek: "epiweek".to_string(),
            location: "location".to_string(),
            value: "value".to_string(),
        }
    }
}

/// Parser for JSON input: a single object or an array of objects
#[derive(Debug, Clone, Default)]
pub struct JsonParser {
    fields: FieldMapping,
}

impl JsonParser {
    /// Creates a new JsonParser with default field names
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new JsonParser with custom field names
    pub fn with_field_mapping(fields: FieldMapping) -> Self {
        Self { fields }
    }

    fn field<'a>(&self, obj: &'a Map<String, Value>, row: usize, name: &str) -> ParserResult<&'a Value> {
        obj.get(name).ok_or_else(|| ParserError::MissingField {
            row,
            field: name.to_string(),
        })
    }

    fn parse_object(&self, obj: &Map<String, Value>, row: usize) -> ParserResult<NewRecord> {
        let invalid = |field: &str, reason: &str| ParserError::InvalidField {
            row,
            field: field.to_string(),
            reason: reason.to_string(),
        };

        let target = self
            .field(obj, row, &self.fields.target)?
            .as_str()
            .ok_or_else(|| invalid(&self.fields.target, "must be a string"))?;

        let epiweek = match self.field(obj, row, &self.fields.epiweek)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| invalid(&self.fields.epiweek, "must be an integer"))?;

        let value = match self.field(obj, row, &self.fields.value)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| invalid(&self.fields.value, "must be a number"))?;

        let location = match obj.get(&self.fields.location) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => parse_location(Some(s.as_str())),
            Some(_) => return Err(invalid(&self.fields.location, "must be a string or null")),
        };

        Ok(NewRecord {
            target: target.to_string(),
            epiweek,
            location,
            value,
        })
    }
}

impl Parser for JsonParser {
    fn parse(&self, input: &[u8]) -> ParserResult<Vec<NewRecord>> {
        let value: Value = serde_json::from_slice(input)
            .map_err(|e| ParserError::InvalidFormat(e.to_string()))?;

        match value {
            Value::Object(obj) => Ok(vec![self.parse_object(&obj, 0)?]),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(row, item)| match item {
                    Value::Object(obj) => self.parse_object(obj, row),
                    _ => Err(ParserError::InvalidFormat(format!(
                        "Array element {} is not an object",
                        row
                    ))),
                })
                .collect(),
            _ => Err(ParserError::InvalidFormat(
                "Input must be a JSON object or array".to_string(),
            )),
        }
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["application/json", "json"]
    }
}

/// Parser for CSV input with a header row
#[derive(Debug, Clone, Default)]
pub struct CsvParser {
    fields: FieldMapping,
    delimiter: Option<u8>,
}

impl CsvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_mapping(fields: FieldMapping) -> Self {
        Self {
            fields,
            delimiter: None,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    fn column(headers: &StringRecord, name: &str) -> Option<usize> {
        headers.iter().position(|h| h == name)
    }
}

impl Parser for CsvParser {
    fn parse(&self, input: &[u8]) -> ParserResult<Vec<NewRecord>> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .delimiter(self.delimiter.unwrap_or(b','))
            .from_reader(input);

        let headers = reader
            .headers()
            .map_err(|e| ParserError::InvalidFormat(e.to_string()))?
            .clone();
        let required = |name: &str| {
            Self::column(&headers, name).ok_or_else(|| ParserError::MissingField {
                row: 0,
                field: name.to_string(),
            })
        };
        let target_col = required(&self.fields.target)?;
        let epiweek_col = required(&self.fields.epiweek)?;
        let value_col = required(&self.fields.value)?;
        let location_col = Self::column(&headers, &self.fields.location);

        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let record = result.map_err(|e| ParserError::InvalidFormat(e.to_string()))?;
            let cell = |col: usize, field: &str| {
                record.get(col).ok_or_else(|| ParserError::MissingField {
                    row,
                    field: field.to_string(),
                })
            };
            let invalid = |field: &str, reason: String| ParserError::InvalidField {
                row,
                field: field.to_string(),
                reason,
            };

            let target = cell(target_col, &self.fields.target)?;
            if target.is_empty() {
                return Err(ParserError::MissingField {
                    row,
                    field: self.fields.target.clone(),
                });
            }
            let epiweek = cell(epiweek_col, &self.fields.epiweek)?
                .parse::<i32>()
                .map_err(|e| invalid(&self.fields.epiweek, e.to_string()))?;
            let value = cell(value_col, &self.fields.value)?
                .parse::<f64>()
                .map_err(|e| invalid(&self.fields.value, e.to_string()))?;
            let location = parse_location(location_col.and_then(|col| record.get(col)));

            records.push(NewRecord {
                target: target.to_string(),
                epiweek,
                location,
                value,
            });
        }

        Ok(records)
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["text/csv", "csv"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_parser_single_record() {
        let parser = JsonParser::new();
        let input = r#"{
            "target": "ili",
            "epiweek": 201501,
            "location": "US",
            "value": 2.5
        }"#
        .as_bytes();

        let records = parser.parse(input).unwrap();
        assert_eq!(records, vec![NewRecord::new("ili", 201501, Some("US"), 2.5)]);
    }

    #[test]
    fn test_json_parser_batch_records() {
        let parser = JsonParser::new();
        let input = r#"[
            {"target": "ili", "epiweek": 201501, "location": null, "value": 1},
            {"target": "ili", "epiweek": "201502", "value": "1.5"}
        ]"#
        .as_bytes();

        let records = parser.parse(input).unwrap();
        assert_eq!(
            records,
            vec![
                NewRecord::new("ili", 201501, None, 1.0),
                NewRecord::new("ili", 201502, None, 1.5),
            ]
        );
    }

    #[test]
    fn test_json_parser_invalid_input() {
        let parser = JsonParser::new();
        let result = parser.parse(br#"{"invalid": "format"}"#);
        assert!(matches!(result, Err(ParserError::MissingField { row: 0, .. })));

        let result = parser.parse(br#"[{"target": "ili", "epiweek": 2015.5, "value": 1}]"#);
        assert!(matches!(result, Err(ParserError::InvalidField { ref field, .. }) if field == "epiweek"));

        let result = parser.parse(br#"[{"target": "ili", "epiweek": 201501, "value": 1, "location": 7}]"#);
        assert!(matches!(result, Err(ParserError::InvalidField { ref field, .. }) if field == "location"));

        assert!(matches!(parser.parse(b"42"), Err(ParserError::InvalidFormat(_))));
        assert!(matches!(parser.parse(b"not json"), Err(ParserError::InvalidFormat(_))));
    }

    #[test]
    fn test_json_parser_custom_mapping() {
        let parser = JsonParser::with_field_mapping(FieldMapping {
            target: "name".to_string(),
            epiweek: "ew".to_string(),
            location: "region".to_string(),
            value: "rate".to_string(),
        });
        let input = r#"{"name": "datasetname_rate", "ew": 201740, "region": "ca", "rate": 0.75}"#;

        let records = parser.parse(input.as_bytes()).unwrap();
        assert_eq!(
            records,
            vec![NewRecord::new("datasetname_rate", 201740, Some("ca"), 0.75)]
        );
    }

    #[test]
    fn test_csv_parser() {
        let parser = CsvParser::new();
        let input = "target,epiweek,location,value\n\
                     ili,201501,US,2.5\n\
                     ili, 201502 ,,3.0\n";

        let records = parser.parse(input.as_bytes()).unwrap();
        assert_eq!(
            records,
            vec![
                NewRecord::new("ili", 201501, Some("US"), 2.5),
                NewRecord::new("ili", 201502, None, 3.0),
            ]
        );
    }

    #[test]
    fn test_csv_parser_without_location_column() {
        let parser = CsvParser::new().with_delimiter(b';');
        let input = "value;epiweek;target\n1.25;201501;ili\n";

        let records = parser.parse(input.as_bytes()).unwrap();
        assert_eq!(records, vec![NewRecord::new("ili", 201501, None, 1.25)]);
    }

    #[test]
    fn test_csv_parser_errors() {
        let parser = CsvParser::new();
        assert!(matches!(
            parser.parse(b"target,location,value\nili,US,1.0\n"),
            Err(ParserError::MissingField { ref field, .. }) if field == "epiweek"
        ));
        assert!(matches!(
            parser.parse(b"target,epiweek,value\nili,week one,1.0\n"),
            Err(ParserError::InvalidField { row: 0, ref field, .. }) if field == "epiweek"
        ));
        assert!(matches!(
            parser.parse(b"target,epiweek,value\nili,201501,1.0\nili,201502,abc\n"),
            Err(ParserError::InvalidField { row: 1, ref field, .. }) if field == "value"
        ));
    }
}
