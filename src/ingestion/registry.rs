use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use super::formats::{CsvParser, JsonParser};
use super::parser::{Parser, ParserError, ParserResult};
use crate::storage::data::NewRecord;

/// Errors that can occur during parser registration and lookup
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No parser found for format: {0}")]
    NoParserFound(String),
    #[error("Invalid format specified: {0}")]
    InvalidFormat(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Priority level for parser registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 50,
    High = 100,
}

/// ParserEntry combines a parser with its priority
#[derive(Clone)]
struct ParserEntry {
    parser: Arc<dyn Parser>,
    priority: Priority,
}

/// ParserRegistry manages registered parsers and their priorities
pub struct ParserRegistry {
    /// Map from lower-cased format name to parser entries, highest priority first
    parsers: RwLock<HashMap<String, Vec<ParserEntry>>>,
    /// Every registered parser, highest priority first, for autodiscovery
    all_parsers: RwLock<Vec<ParserEntry>>,
}

impl ParserRegistry {
    /// Creates a new, empty parser registry
    pub fn new() -> Self {
        Self {
            parsers: RwLock::new(HashMap::new()),
            all_parsers: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry with the built-in JSON and CSV parsers
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.add_entry(Arc::new(JsonParser::new()), Priority::Normal);
        registry.add_entry(Arc::new(CsvParser::new()), Priority::Low);
        registry
    }

    /// Register a parser for its formats with a given priority
    pub fn register<P>(&self, parser: Arc<P>, priority: Priority) -> RegistryResult<()>
    where
        P: Parser + 'static,
    {
        let formats = parser.supported_formats();
        if formats.is_empty() {
            return Err(RegistryError::InvalidFormat(
                "Parser doesn't support any formats".to_string(),
            ));
        }
        self.add_entry(parser, priority);
        Ok(())
    }

    /// Adds a parser under each of its formats. A parser with no formats is
    /// reachable only through autodiscovery.
    fn add_entry(&self, parser: Arc<dyn Parser>, priority: Priority) {
        let formats = parser.supported_formats();
        let entry = ParserEntry { parser, priority };

        let mut parsers_map = self.parsers.write().unwrap_or_else(PoisonError::into_inner);
        for format in formats {
            let entries = parsers_map.entry(format.to_lowercase()).or_default();
            entries.push(entry.clone());
            // Stable sort keeps earlier registrations first within a priority
            entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        let mut all_parsers = self.all_parsers.write().unwrap_or_else(PoisonError::into_inner);
        all_parsers.push(entry);
        all_parsers.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Get the highest priority parser for a format
    pub fn get_parser(&self, format: &str) -> RegistryResult<Arc<dyn Parser>> {
        let parsers_map = self.parsers.read().unwrap_or_else(PoisonError::into_inner);
        parsers_map
            .get(&format.to_lowercase())
            .and_then(|entries| entries.first())
            .map(|entry| Arc::clone(&entry.parser))
            .ok_or_else(|| RegistryError::NoParserFound(format.to_string()))
    }

    /// Get the parser for a file, chosen by its extension
    pub fn parser_for_path(&self, path: &Path) -> RegistryResult<Arc<dyn Parser>> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| RegistryError::InvalidFormat(format!("{} has no extension", path.display())))?;
        self.get_parser(extension)
    }

    /// Parse data with autodiscovery (tries each parser until one succeeds)
    pub fn parse_with_autodiscovery(&self, input: &[u8]) -> ParserResult<Vec<NewRecord>> {
        let all_parsers = self.all_parsers.read().unwrap_or_else(PoisonError::into_inner);
        if all_parsers.is_empty() {
            return Err(ParserError::InvalidFormat("No parsers registered".to_string()));
        }

        let mut last_error = None;
        for entry in all_parsers.iter() {
            match entry.parser.parse(input) {
                Ok(records) => return Ok(records),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| ParserError::InvalidFormat("All parsers failed".to_string())))
    }

    /// Parse data using a specific format
    pub fn parse_with_format(&self, format: &str, input: &[u8]) -> ParserResult<Vec<NewRecord>> {
        match self.get_parser(format) {
            Ok(parser) => parser.parse(input),
            Err(err) => Err(ParserError::InvalidFormat(err.to_string())),
        }
    }

    /// List all registered formats
    pub fn list_formats(&self) -> Vec<String> {
        let parsers_map = self.parsers.read().unwrap_or_else(PoisonError::into_inner);
        let mut formats: Vec<String> = parsers_map.keys().cloned().collect();
        formats.sort();
        formats
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
