//! Storage module for tvdb
//! Holds the record model, the indexed in-memory store and its write-ahead log.

pub mod data;
pub mod epiweek;
pub mod index;
pub mod store;
pub mod wal;

pub use data::{DataError, NewRecord, Record, RecordId, RecordKey};
pub use epiweek::{Epiweek, EpiweekError};
pub use store::{RecordStore, Scan, StoreError, StoreStats, StoreView, Upserted};
