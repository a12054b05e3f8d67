//! Durable record store: a [`RecordStore`] whose mutations are logged to a
//! [`WriteAheadLog`] before they are applied.

use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::WalConfig;
use crate::storage::data::{NewRecord, RecordId, RecordKey};
use crate::storage::store::{RecordStore, StoreError, StoreView, Upserted};
use crate::storage::wal::{ReplayStats, WalError, WalOp, WriteAheadLog};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Write-ahead log error: {0}")]
    Wal(#[from] WalError),
}

/// Counts from a batch upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub inserted: usize,
    pub replaced: usize,
}

pub struct Database {
    store: RecordStore,
    wal: WriteAheadLog,
    /// Serializes mutations so log order matches apply order
    writer: Mutex<()>,
}

impl Database {
    /// Opens the database in `directory`, replaying any existing log
    pub fn open<P: AsRef<Path>>(directory: P, config: &WalConfig) -> Result<Self, DatabaseError> {
        let wal = WriteAheadLog::new(directory)?
            .with_max_segment_size(config.max_segment_size)
            .with_sync_on_write(config.sync_on_write);
        let store = RecordStore::new();

        let stats: ReplayStats = wal.replay(|op| {
            match op {
                WalOp::Insert { record } | WalOp::Upsert { record } => {
                    store.restore(record);
                }
                WalOp::Delete { key } => {
                    store.delete_key(&key);
                }
                WalOp::Reserve { next_id } => store.advance_next_id(next_id),
            }
            Ok(())
        })?;

        info!(
            "Opened database: directory={}, records={}, next_id={}, replayed_entries={}",
            wal.directory().display(),
            store.len(),
            store.next_id(),
            stats.entries
        );

        Ok(Self {
            store,
            wal,
            writer: Mutex::new(()),
        })
    }

    /// Read access to the underlying store. Reads never wait on the log.
    pub fn store(&self) -> StoreView<'_> {
        StoreView::new(&self.store)
    }

    /// Inserts a new record, rejecting an existing key
    pub async fn insert(
        &self,
        target: &str,
        epiweek: i32,
        location: Option<&str>,
        value: f64,
    ) -> Result<RecordId, DatabaseError> {
        self.insert_record(NewRecord::new(target, epiweek, location, value)).await
    }

    pub async fn insert_record(&self, new: NewRecord) -> Result<RecordId, DatabaseError> {
        let _writer = self.writer.lock().await;
        let record = self.store.reserve(&new, true)?;
        let id = record.id();
        self.wal.append(&WalOp::Insert { record: record.clone() }).await?;
        self.store.restore(record);
        Ok(id)
    }

    /// Replaces whatever is stored under the key with a new record
    pub async fn upsert(
        &self,
        target: &str,
        epiweek: i32,
        location: Option<&str>,
        value: f64,
    ) -> Result<Upserted, DatabaseError> {
        let _writer = self.writer.lock().await;
        self.upsert_locked(NewRecord::new(target, epiweek, location, value)).await
    }

    async fn upsert_locked(&self, new: NewRecord) -> Result<Upserted, DatabaseError> {
        let record = self.store.reserve(&new, false)?;
        let id = record.id();
        self.wal.append(&WalOp::Upsert { record: record.clone() }).await?;
        let replaced = self.store.restore(record);
        Ok(Upserted { id, replaced })
    }

    /// Upserts a batch of records.
    ///
    /// Every record is validated before anything is written, so an invalid
    /// record rejects the whole batch.
    pub async fn upsert_batch(&self, records: Vec<NewRecord>) -> Result<BatchSummary, DatabaseError> {
        for record in &records {
            record.validate().map_err(StoreError::from)?;
        }

        let _writer = self.writer.lock().await;
        let mut summary = BatchSummary::default();
        for record in records {
            match self.upsert_locked(record).await?.replaced {
                Some(_) => summary.replaced += 1,
                None => summary.inserted += 1,
            }
        }

        debug!(
            "Upserted batch: inserted={}, replaced={}",
            summary.inserted, summary.replaced
        );
        Ok(summary)
    }

    /// Removes a record. Returns true if one was removed.
    pub async fn delete(&self, target: &str, epiweek: i32, location: Option<&str>) -> Result<bool, DatabaseError> {
        let key = RecordKey::new(target, epiweek, location);
        let _writer = self.writer.lock().await;
        if !self.store.contains(&key) {
            return Ok(false);
        }
        self.wal.append(&WalOp::Delete { key: key.clone() }).await?;
        Ok(self.store.delete_key(&key).is_some())
    }

    /// Rewrites the log as a snapshot of the live records.
    /// Returns the number of segments removed.
    pub async fn compact(&self) -> Result<usize, DatabaseError> {
        let _writer = self.writer.lock().await;
        Ok(self.wal.compact(self.store.scan_all(), self.store.next_id()).await?)
    }

    /// Checks the log checksums without replaying it
    pub fn verify(&self) -> Result<bool, DatabaseError> {
        Ok(self.wal.verify()?)
    }
}
