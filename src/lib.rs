//! tvdb - a store of surveillance target values
//!
//! Records hold a target name, an epiweek, an optional location and a value,
//! unique on (target, epiweek, location) and indexed on each column. The
//! in-memory store is made durable by a write-ahead log.

pub mod config;
pub mod db;
pub mod ingestion;
pub mod metrics;
pub mod storage;

pub use config::Config;
pub use db::{Database, DatabaseError};
pub use storage::{Record, RecordKey, RecordStore, StoreError};
