//! Performance metrics collection for tvdb
//!
//! This module provides functionality for collecting and exposing store metrics
//! in Prometheus format. Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Initialize the metrics collection system with an HTTP listener on `addr`
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record a newly stored record
pub fn record_insert(value: f64) {
    counter!("tvdb.store.inserts").increment(1);
    histogram!("tvdb.store.value").record(value);
}

/// Record an insert rejected for an existing key
pub fn record_duplicate() {
    counter!("tvdb.store.duplicates").increment(1);
}

/// Record a removed record
pub fn record_delete() {
    counter!("tvdb.store.deletes").increment(1);
}

/// Record a scan and the number of records it matched
pub fn record_scan(kind: &'static str, matched: usize) {
    counter!("tvdb.store.scans", "kind" => kind).increment(1);
    histogram!("tvdb.store.scan_size", "kind" => kind).record(matched as f64);
}

/// Update the number of live records
pub fn update_record_count(count: usize) {
    gauge!("tvdb.store.records").set(count as f64);
}

/// Record bytes appended to the write-ahead log
pub fn record_wal_write(bytes: u64) {
    counter!("tvdb.wal.bytes_written").increment(bytes);
}

/// Record a write-ahead log segment operation ("rotate", "compact", ...)
pub fn record_wal_operation(operation: &'static str) {
    counter!("tvdb.wal.operations", "operation" => operation).increment(1);
}

/// Record an ingestion batch
pub fn record_ingestion(inserted: usize, replaced: usize, rejected: usize) {
    counter!("tvdb.ingestion.inserted").increment(inserted as u64);
    counter!("tvdb.ingestion.replaced").increment(replaced as u64);
    counter!("tvdb.ingestion.rejected").increment(rejected as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_insert(2.5);
        record_duplicate();
        record_delete();
        record_scan("target", 3);
        update_record_count(10);
        record_wal_write(128);
        record_wal_operation("rotate");
        record_ingestion(1, 2, 3);
    }
}
