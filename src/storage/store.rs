use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

use crate::metrics;
use crate::storage::data::{DataError, NewRecord, Record, RecordId, RecordKey};
use crate::storage::epiweek::{Epiweek, EpiweekError};
use crate::storage::index::SecondaryIndex;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] DataError),
    #[error("Duplicate key: {0}")]
    DuplicateKey(RecordKey),
    #[error("Record not found: {0}")]
    NotFound(RecordKey),
    #[error("Invalid epiweek range: {0}")]
    InvalidRange(#[from] EpiweekError),
}

/// Outcome of an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    /// Id of the newly created record
    pub id: RecordId,
    /// The record previously stored under the same key, if any
    pub replaced: Option<Record>,
}

/// Point-in-time counts of the store contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub targets: usize,
    pub epiweeks: usize,
    pub locations: usize,
}

/// The primary mapping and its three secondary indexes
#[derive(Debug, Default)]
struct Tables {
    primary: HashMap<RecordKey, Arc<Record>>,
    by_target: SecondaryIndex<String>,
    by_epiweek: SecondaryIndex<i32>,
    by_location: SecondaryIndex<Option<String>>,
}

impl Tables {
    fn put(&mut self, record: Arc<Record>) -> Option<Arc<Record>> {
        let key = record.key().clone();
        let replaced = self.take(&key);
        self.by_target.insert(key.target.clone(), key.clone());
        self.by_epiweek.insert(key.epiweek, key.clone());
        self.by_location.insert(key.location.clone(), key.clone());
        self.primary.insert(key, record);
        replaced
    }

    fn take(&mut self, key: &RecordKey) -> Option<Arc<Record>> {
        let record = self.primary.remove(key)?;
        self.by_target.remove(&key.target, key);
        self.by_epiweek.remove(&key.epiweek, key);
        self.by_location.remove(&key.location, key);
        Some(record)
    }

    fn collect<'a>(&self, keys: impl Iterator<Item = &'a RecordKey>) -> Vec<Arc<Record>> {
        keys.filter_map(|key| self.primary.get(key).cloned()).collect()
    }
}

/// An in-process store of target values keyed by (target, epiweek, location).
///
/// One lock guards the primary mapping and all secondary indexes, so a reader
/// never observes a record without its index entries or the reverse. Scans
/// copy the matching records out under the read lock and iterate the copy.
#[derive(Debug)]
pub struct RecordStore {
    tables: RwLock<Tables>,
    /// Id handed to the next created record; starts at 1 and only grows
    next_id: AtomicU64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    // A panic while holding the lock cannot leave the tables half-updated:
    // every mutation validates before touching them.
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new record, rejecting an existing key
    pub fn insert(
        &self,
        target: &str,
        epiweek: i32,
        location: Option<&str>,
        value: f64,
    ) -> Result<RecordId, StoreError> {
        self.insert_record(NewRecord::new(target, epiweek, location, value))
    }

    /// Inserts a new record, rejecting an existing key
    pub fn insert_record(&self, new: NewRecord) -> Result<RecordId, StoreError> {
        new.validate()?;
        let key = new.key();

        let mut tables = self.write();
        if tables.primary.contains_key(&key) {
            metrics::record_duplicate();
            return Err(StoreError::DuplicateKey(key));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tables.put(Arc::new(Record::new(id, key, new.value)));
        let size = tables.primary.len();
        drop(tables);

        debug!("Inserted record: id={}, target={}, epiweek={}, size={}", id, new.target, new.epiweek, size);
        metrics::record_insert(new.value);
        metrics::update_record_count(size);
        Ok(id)
    }

    /// Replaces whatever is stored under the key with a new record.
    ///
    /// The new record always receives a fresh id; the replaced record keeps
    /// its id and is returned.
    pub fn upsert(
        &self,
        target: &str,
        epiweek: i32,
        location: Option<&str>,
        value: f64,
    ) -> Result<Upserted, StoreError> {
        self.upsert_record(NewRecord::new(target, epiweek, location, value))
    }

    pub fn upsert_record(&self, new: NewRecord) -> Result<Upserted, StoreError> {
        new.validate()?;
        let key = new.key();

        let mut tables = self.write();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let replaced = tables.put(Arc::new(Record::new(id, key, new.value)));
        let size = tables.primary.len();
        drop(tables);

        debug!(
            "Upserted record: id={}, target={}, epiweek={}, replaced={:?}",
            id,
            new.target,
            new.epiweek,
            replaced.as_ref().map(|r| r.id())
        );
        metrics::record_insert(new.value);
        metrics::update_record_count(size);
        Ok(Upserted {
            id,
            replaced: replaced.map(|r| (*r).clone()),
        })
    }

    /// Looks up a single record by its composite key
    pub fn get(&self, target: &str, epiweek: i32, location: Option<&str>) -> Result<Record, StoreError> {
        self.get_key(&RecordKey::new(target, epiweek, location))
    }

    pub fn get_key(&self, key: &RecordKey) -> Result<Record, StoreError> {
        self.read()
            .primary
            .get(key)
            .map(|record| (**record).clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.read().primary.contains_key(key)
    }

    /// Removes a record. Returns true if one was removed.
    pub fn delete(&self, target: &str, epiweek: i32, location: Option<&str>) -> bool {
        self.delete_key(&RecordKey::new(target, epiweek, location)).is_some()
    }

    /// Removes a record and returns it
    pub fn delete_key(&self, key: &RecordKey) -> Option<Record> {
        let mut tables = self.write();
        let removed = tables.take(key)?;
        let size = tables.primary.len();
        drop(tables);

        debug!("Deleted record: id={}, key={}, size={}", removed.id(), key, size);
        metrics::record_delete();
        metrics::update_record_count(size);
        Some((*removed).clone())
    }

    /// Records for a target, in ascending epiweek order
    pub fn scan_by_target(&self, target: &str) -> Scan {
        let records = {
            let tables = self.read();
            tables.collect(tables.by_target.get(&target.to_string()))
        };
        Scan::new("target", records)
    }

    /// Records for an epiweek
    pub fn scan_by_epiweek(&self, epiweek: i32) -> Scan {
        let records = {
            let tables = self.read();
            tables.collect(tables.by_epiweek.get(&epiweek))
        };
        Scan::new("epiweek", records)
    }

    /// Records for a location
    pub fn scan_by_location(&self, location: &str) -> Scan {
        let records = {
            let tables = self.read();
            tables.collect(tables.by_location.get(&Some(location.to_string())))
        };
        Scan::new("location", records)
    }

    /// Records stored without a location
    pub fn scan_without_location(&self) -> Scan {
        let records = {
            let tables = self.read();
            tables.collect(tables.by_location.get(&None))
        };
        Scan::new("location", records)
    }

    /// Records of one (target, location) series with `first <= epiweek <= last`,
    /// in ascending epiweek order
    pub fn scan_range(&self, target: &str, location: Option<&str>, first: i32, last: i32) -> Scan {
        let records = {
            let tables = self.read();
            tables.collect(
                tables
                    .by_target
                    .get(&target.to_string())
                    .filter(|key| key.location.as_deref() == location)
                    .filter(|key| (first..=last).contains(&key.epiweek)),
            )
        };
        Scan::new("range", records)
    }

    /// Every record, in key order
    pub fn scan_all(&self) -> Scan {
        let mut records: Vec<Arc<Record>> = self.read().primary.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        Scan::new("all", records)
    }

    /// Epiweeks in `first..=last` for which a series has no record
    pub fn missing_epiweeks(
        &self,
        target: &str,
        location: Option<&str>,
        first: i32,
        last: i32,
    ) -> Result<Vec<i32>, StoreError> {
        let first = Epiweek::try_from(first)?;
        let last = Epiweek::try_from(last)?;
        let present: HashSet<i32> = self
            .scan_range(target, location, first.value(), last.value())
            .map(|record| record.epiweek())
            .collect();
        Ok(Epiweek::range(first, last)
            .map(|week| week.value())
            .filter(|week| !present.contains(week))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.read().primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id the next created record will receive
    pub fn next_id(&self) -> RecordId {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StoreStats {
        let tables = self.read();
        StoreStats {
            records: tables.primary.len(),
            targets: tables.by_target.cardinality(),
            epiweeks: tables.by_epiweek.cardinality(),
            locations: tables.by_location.cardinality(),
        }
    }

    /// Validates a record and reserves an id for it without storing it.
    ///
    /// With `reject_existing`, fails if the key is already present. The
    /// reserved id is consumed even if the record is never committed.
    pub(crate) fn reserve(&self, new: &NewRecord, reject_existing: bool) -> Result<Record, StoreError> {
        new.validate()?;
        let key = new.key();
        if reject_existing && self.contains(&key) {
            metrics::record_duplicate();
            return Err(StoreError::DuplicateKey(key));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Record::new(id, key, new.value))
    }

    /// Moves the id counter forward to at least `next_id`
    pub(crate) fn advance_next_id(&self, next_id: RecordId) {
        self.next_id.fetch_max(next_id, Ordering::SeqCst);
    }

    /// Stores a record that already carries an id, replacing any record under
    /// the same key, and advances the id counter past it
    pub(crate) fn restore(&self, record: Record) -> Option<Record> {
        self.advance_next_id(record.id() + 1);
        let value = record.value();
        let mut tables = self.write();
        let replaced = tables.put(Arc::new(record));
        let size = tables.primary.len();
        drop(tables);

        metrics::record_insert(value);
        metrics::update_record_count(size);
        replaced.map(|r| (*r).clone())
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only access to a store whose writes go through another owner.
///
/// [`Database`](crate::Database) hands these out so that every mutation
/// passes through its write-ahead log:
///
/// ```compile_fail
/// # async fn write_around_the_log(db: &tvdb::Database) {
/// db.store().insert("ili", 201501, None, 1.0);
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StoreView<'a> {
    store: &'a RecordStore,
}

impl<'a> StoreView<'a> {
    pub(crate) fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    pub fn get(&self, target: &str, epiweek: i32, location: Option<&str>) -> Result<Record, StoreError> {
        self.store.get(target, epiweek, location)
    }

    pub fn get_key(&self, key: &RecordKey) -> Result<Record, StoreError> {
        self.store.get_key(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.store.contains(key)
    }

    pub fn scan_by_target(&self, target: &str) -> Scan {
        self.store.scan_by_target(target)
    }

    pub fn scan_by_epiweek(&self, epiweek: i32) -> Scan {
        self.store.scan_by_epiweek(epiweek)
    }

    pub fn scan_by_location(&self, location: &str) -> Scan {
        self.store.scan_by_location(location)
    }

    pub fn scan_without_location(&self) -> Scan {
        self.store.scan_without_location()
    }

    pub fn scan_range(&self, target: &str, location: Option<&str>, first: i32, last: i32) -> Scan {
        self.store.scan_range(target, location, first, last)
    }

    pub fn scan_all(&self) -> Scan {
        self.store.scan_all()
    }

    pub fn missing_epiweeks(
        &self,
        target: &str,
        location: Option<&str>,
        first: i32,
        last: i32,
    ) -> Result<Vec<i32>, StoreError> {
        self.store.missing_epiweeks(target, location, first, last)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn next_id(&self) -> RecordId {
        self.store.next_id()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}

/// A lazy, finite, restartable sequence of records.
///
/// The matching records are snapshotted when the scan is created; later
/// writes to the store do not affect it.
#[derive(Debug, Clone)]
pub struct Scan {
    records: Arc<[Arc<Record>]>,
    position: usize,
}

impl Scan {
    fn new(kind: &'static str, records: Vec<Arc<Record>>) -> Self {
        metrics::record_scan(kind, records.len());
        Self {
            records: records.into(),
            position: 0,
        }
    }

    /// Rewinds the scan to its first record
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for Scan {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.position)?;
        self.position += 1;
        Some((**record).clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.records.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Scan {}
