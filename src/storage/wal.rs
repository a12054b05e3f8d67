use chrono::Utc;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::storage::data::{Record, RecordKey};

const WAL_MAGIC: u32 = 0x54564C00; // "TVL\0"
const WAL_VERSION: u32 = 1;
const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024; // 64MB
const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXTENSION: &str = "wal";

static CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid WAL header in {0}: {1}")]
    InvalidHeader(PathBuf, String),
    #[error("Invalid WAL entry in {0} at line {1}")]
    InvalidEntry(PathBuf, usize),
    #[error("Corrupted WAL entry in {0} at line {1}: CRC mismatch")]
    CorruptedEntry(PathBuf, usize),
}

#[derive(Debug, Serialize, Deserialize)]
struct WalHeader {
    magic: u32,
    version: u32,
    created_at: i64,
}

/// A single logged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    Insert { record: Record },
    Upsert { record: Record },
    Delete { key: RecordKey },
    /// The id counter at snapshot time, so ids freed by deletes stay unused
    Reserve { next_id: u64 },
}

/// Summary of a replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments: usize,
    pub entries: usize,
    /// Whether an incomplete trailing entry was found and truncated
    pub truncated_tail: bool,
}

/// Represents a WAL segment file
#[derive(Debug)]
struct Segment {
    path: PathBuf,
    sequence: u64,
    size: u64,
}

impl Segment {
    fn open(path: PathBuf, sequence: u64) -> io::Result<Self> {
        let size = fs::metadata(&path)?.len();
        Ok(Self {
            path,
            sequence,
            size,
        })
    }

    fn is_full(&self, max_size: u64) -> bool {
        self.size >= max_size
    }
}

/// Parses the sequence number out of `segment_<seq>_<uuid>.wal`
fn parse_sequence(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix(SEGMENT_PREFIX)?;
    let (sequence, _) = rest.split_once('_')?;
    sequence.parse().ok()
}

/// Encodes an op as `<json>\t<crc hex>\n`
fn encode_entry(op: &WalOp) -> Result<String, WalError> {
    let json = serde_json::to_string(op)?;
    let crc = CRC.checksum(json.as_bytes());
    Ok(format!("{}\t{:08x}\n", json, crc))
}

enum Decoded {
    Op(WalOp),
    Malformed,
    CrcMismatch,
}

/// Decodes one raw log line; bytes that are not UTF-8 are malformed
fn decode_line(line: &[u8]) -> Decoded {
    match std::str::from_utf8(line) {
        Ok(line) => decode_entry(line),
        Err(_) => Decoded::Malformed,
    }
}

fn decode_entry(line: &str) -> Decoded {
    let Some((json, crc)) = line.trim_end_matches('\n').rsplit_once('\t') else {
        return Decoded::Malformed;
    };
    let Ok(expected) = u32::from_str_radix(crc, 16) else {
        return Decoded::Malformed;
    };
    if CRC.checksum(json.as_bytes()) != expected {
        return Decoded::CrcMismatch;
    }
    match serde_json::from_str(json) {
        Ok(op) => Decoded::Op(op),
        Err(_) => Decoded::Malformed,
    }
}

/// Splits segment contents into lines, each keeping its trailing newline
fn split_lines(contents: &[u8]) -> impl Iterator<Item = &[u8]> {
    contents.split_inclusive(|byte| *byte == b'\n')
}

/// Writes a single encoded entry to an open segment file
fn write_entry(file: &File, entry: &[u8], sync: bool) -> io::Result<()> {
    let mut writer = BufWriter::new(file);
    writer.write_all(entry)?;
    writer.flush()?;
    drop(writer);
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

/// Runs `write` against a segment of `size` bytes, cutting the file back to
/// `size` if it fails so a partial entry never precedes the next one
fn write_or_rollback<F>(file: &File, size: u64, write: F) -> io::Result<()>
where
    F: FnOnce(&File) -> io::Result<()>,
{
    write(file).map_err(|err| match file.set_len(size) {
        Ok(()) => err,
        Err(truncate_err) => io::Error::new(
            err.kind(),
            format!("{} (truncating partial entry also failed: {})", err, truncate_err),
        ),
    })
}

/// Manages the Write-Ahead Log.
///
/// Every mutation of the store is appended here before it is applied, and the
/// log is replayed on startup to rebuild the store.
pub struct WriteAheadLog {
    directory: PathBuf,
    current_segment: RwLock<Option<Segment>>,
    next_sequence: RwLock<u64>,
    max_segment_size: u64,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens (creating if needed) a WAL in the specified directory
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self, WalError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let next_sequence = Self::list_segments(&directory)?
            .last()
            .map_or(1, |segment| segment.sequence + 1);

        Ok(Self {
            directory,
            current_segment: RwLock::new(None),
            next_sequence: RwLock::new(next_sequence),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            sync_on_write: false,
        })
    }

    /// Sets the maximum size for WAL segments
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Fsyncs the segment after every append
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Appends an op to the log. Returns the number of bytes written.
    pub async fn append(&self, op: &WalOp) -> Result<u64, WalError> {
        let entry = encode_entry(op)?;
        let mut segment_guard = self.current_segment.write().await;

        let segment = match segment_guard.take() {
            Some(segment) if !segment.is_full(self.max_segment_size) => segment,
            _ => self.rotate_segment().await?,
        };
        let segment = segment_guard.insert(segment);
        let file = OpenOptions::new().append(true).open(&segment.path)?;
        let written = write_or_rollback(&file, segment.size, |file| {
            write_entry(file, entry.as_bytes(), self.sync_on_write)
        });
        if let Err(err) = written {
            warn!("Failed WAL append: segment={}, error={}", segment.path.display(), err);
            // Truncation can fail as well, so later entries go to a fresh
            // segment.
            *segment_guard = None;
            return Err(err.into());
        }

        let bytes = entry.len() as u64;
        segment.size += bytes;
        metrics::record_wal_write(bytes);
        Ok(bytes)
    }

    /// Creates a new segment file with a header and returns it
    async fn rotate_segment(&self) -> Result<Segment, WalError> {
        let mut next_sequence = self.next_sequence.write().await;
        let sequence = *next_sequence;
        let path = self.segment_path(sequence);
        Self::write_segment(&path, std::iter::empty::<&WalOp>())?;
        *next_sequence += 1;

        debug!("Rotated WAL segment: {}", path.display());
        metrics::record_wal_operation("rotate");
        Ok(Segment::open(path, sequence)?)
    }

    fn segment_path(&self, sequence: u64) -> PathBuf {
        self.directory.join(format!(
            "{}{:010}_{}.{}",
            SEGMENT_PREFIX,
            sequence,
            Uuid::new_v4(),
            SEGMENT_EXTENSION
        ))
    }

    /// Writes a complete segment (header plus ops) to `path`
    fn write_segment<'a>(path: &Path, ops: impl Iterator<Item = &'a WalOp>) -> Result<(), WalError> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let header = WalHeader {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            created_at: Utc::now().timestamp(),
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;
        for op in ops {
            writer.write_all(encode_entry(op)?.as_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replays every segment in sequence order, calling `callback` per op.
    ///
    /// An incomplete final line in the last segment is a torn write: it is
    /// truncated away with a warning. Any other bad entry is an error.
    pub fn replay<F>(&self, mut callback: F) -> Result<ReplayStats, WalError>
    where
        F: FnMut(WalOp) -> Result<(), WalError>,
    {
        let segments = Self::list_segments(&self.directory)?;
        let mut stats = ReplayStats::default();

        for (i, segment) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            let valid_len = self.replay_segment(&segment.path, is_last, &mut |op| {
                stats.entries += 1;
                callback(op)
            })?;
            if valid_len < segment.size {
                warn!(
                    "Truncating incomplete WAL entry: segment={}, offset={}",
                    segment.path.display(),
                    valid_len
                );
                OpenOptions::new()
                    .write(true)
                    .open(&segment.path)?
                    .set_len(valid_len)?;
                stats.truncated_tail = true;
            }
            stats.segments += 1;
        }

        info!(
            "Replayed WAL: segments={}, entries={}",
            stats.segments, stats.entries
        );
        Ok(stats)
    }

    /// Replays a single segment. Returns the length of its valid prefix.
    fn replay_segment<F>(&self, path: &Path, is_last: bool, callback: &mut F) -> Result<u64, WalError>
    where
        F: FnMut(WalOp) -> Result<(), WalError>,
    {
        let contents = fs::read(path)?;
        let mut lines = split_lines(&contents);

        let header_line = lines.next().unwrap_or_default();
        let header: WalHeader = serde_json::from_slice(header_line)
            .map_err(|e| WalError::InvalidHeader(path.to_path_buf(), e.to_string()))?;
        if header.magic != WAL_MAGIC {
            return Err(WalError::InvalidHeader(
                path.to_path_buf(),
                "Invalid magic number".to_string(),
            ));
        }
        if header.version != WAL_VERSION {
            return Err(WalError::InvalidHeader(
                path.to_path_buf(),
                format!("Unsupported WAL version {}", header.version),
            ));
        }

        let mut offset = header_line.len() as u64;
        for (line_no, line) in lines.enumerate() {
            let torn = is_last && !line.ends_with(b"\n");
            match decode_line(line) {
                Decoded::Op(op) if !torn => callback(op)?,
                _ if torn => break,
                Decoded::Op(_) | Decoded::Malformed => {
                    return Err(WalError::InvalidEntry(path.to_path_buf(), line_no + 2))
                }
                Decoded::CrcMismatch => {
                    return Err(WalError::CorruptedEntry(path.to_path_buf(), line_no + 2))
                }
            }
            offset += line.len() as u64;
        }

        Ok(offset)
    }

    /// Verifies WAL integrity without applying anything
    pub fn verify(&self) -> Result<bool, WalError> {
        for segment in Self::list_segments(&self.directory)? {
            let contents = fs::read(&segment.path)?;
            let mut lines = split_lines(&contents);
            let header_ok = lines
                .next()
                .and_then(|line| serde_json::from_slice::<WalHeader>(line).ok())
                .is_some_and(|h| h.magic == WAL_MAGIC && h.version == WAL_VERSION);
            if !header_ok {
                return Ok(false);
            }
            if lines.any(|line| !matches!(decode_line(line), Decoded::Op(_))) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replaces the whole log with a single segment holding `records`.
    ///
    /// The snapshot is written to a temporary file and renamed into place
    /// before older segments are removed, so a crash at any point leaves a
    /// log that replays to the same state.
    pub async fn compact<I>(&self, records: I, next_id: u64) -> Result<usize, WalError>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut segment_guard = self.current_segment.write().await;
        let mut next_sequence = self.next_sequence.write().await;

        let ops: Vec<WalOp> = std::iter::once(WalOp::Reserve { next_id })
            .chain(records.into_iter().map(|record| WalOp::Insert { record }))
            .collect();
        let sequence = *next_sequence;
        let path = self.segment_path(sequence);
        let tmp_path = path.with_extension("tmp");
        Self::write_segment(&tmp_path, ops.iter())?;
        fs::rename(&tmp_path, &path)?;
        *next_sequence += 1;

        let mut removed = 0;
        for segment in Self::list_segments(&self.directory)? {
            if segment.sequence < sequence {
                fs::remove_file(&segment.path)?;
                removed += 1;
            }
        }
        *segment_guard = Some(Segment::open(path, sequence)?);

        info!(
            "Compacted WAL: records={}, segments_removed={}",
            ops.len() - 1,
            removed
        );
        metrics::record_wal_operation("compact");
        Ok(removed)
    }

    /// Gets all WAL segments, ordered by sequence number
    fn list_segments(directory: &Path) -> Result<Vec<Segment>, WalError> {
        let mut segments = Vec::new();

        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            if let Some(sequence) = parse_sequence(&path) {
                segments.push(Segment::open(path, sequence)?);
            }
        }

        segments.sort_by_key(|s| s.sequence);
        Ok(segments)
    }
}

impl fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current_segment = self
            .current_segment
            .try_read()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|segment| {
                        format!(
                            "Segment {{ path: {:?}, size: {} bytes }}",
                            segment.path, segment.size
                        )
                    })
                    .unwrap_or_else(|| "None".to_string())
            })
            .unwrap_or_else(|_| "Locked".to_string());

        f.debug_struct("WriteAheadLog")
            .field("directory", &self.directory)
            .field("current_segment", &current_segment)
            .field(
                "max_segment_size",
                &format!("{} bytes", self.max_segment_size),
            )
            .field("sync_on_write", &self.sync_on_write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn insert_op(id: u64, epiweek: i32) -> WalOp {
        WalOp::Insert {
            record: Record::new(id, RecordKey::new("ili", epiweek, Some("US")), id as f64),
        }
    }

    fn wal_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "wal"))
            .collect();
        files.sort();
        files
    }

    fn replay_all(wal: &WriteAheadLog) -> Vec<WalOp> {
        let mut ops = Vec::new();
        wal.replay(|op| {
            ops.push(op);
            Ok(())
        })
        .unwrap();
        ops
    }

    #[tokio::test]
    async fn test_wal_creation_and_append() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path()).unwrap();
        assert!(wal_files(dir.path()).is_empty());

        let bytes = wal.append(&insert_op(1, 201501)).await.unwrap();
        assert!(bytes > 0);

        let segment = wal.current_segment.read().await;
        assert!(segment.as_ref().unwrap().path.exists());
        assert_eq!(wal_files(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_wal_segment_rotation() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path())
            .unwrap()
            .with_max_segment_size(50); // Very small size to trigger rotation

        for i in 1..=20 {
            wal.append(&insert_op(i, 201500 + i as i32)).await.unwrap();
        }

        let files = wal_files(dir.path());
        assert!(files.len() > 1, "Expected multiple segments, got {}", files.len());

        // Replay follows sequence order across segments
        let ids: Vec<u64> = replay_all(&wal)
            .into_iter()
            .map(|op| match op {
                WalOp::Insert { record } => record.id(),
                other => panic!("unexpected op {:?}", other),
            })
            .collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_wal_recovery() {
        let dir = tempdir().unwrap();
        let ops = vec![
            insert_op(1, 201501),
            WalOp::Upsert {
                record: Record::new(2, RecordKey::new("ili", 201501, Some("US")), 9.5),
            },
            WalOp::Delete {
                key: RecordKey::new("ili", 201501, None),
            },
        ];
        {
            let wal = WriteAheadLog::new(dir.path()).unwrap();
            for op in &ops {
                wal.append(op).await.unwrap();
            }
        }

        // A new WAL instance simulates a restart
        let recovered = WriteAheadLog::new(dir.path()).unwrap();
        assert_eq!(replay_all(&recovered), ops);

        // New appends go to a fresh segment after the existing one
        recovered.append(&insert_op(3, 201502)).await.unwrap();
        assert_eq!(wal_files(dir.path()).len(), 2);
        assert_eq!(replay_all(&recovered).len(), 4);
    }

    #[tokio::test]
    async fn test_wal_corruption_detection() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path()).unwrap();
        wal.append(&insert_op(1, 201501)).await.unwrap();
        wal.append(&insert_op(2, 201502)).await.unwrap();
        assert!(wal.verify().unwrap());

        // Flip the stored value of the first entry
        let path = wal_files(dir.path()).remove(0);
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replacen("\"value\":1.0", "\"value\":7.0", 1)).unwrap();

        assert!(!wal.verify().unwrap());
        let result = wal.replay(|_| Ok(()));
        assert!(matches!(result, Err(WalError::CorruptedEntry(_, 2))));
    }

    #[tokio::test]
    async fn test_wal_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path()).unwrap();
        wal.append(&insert_op(1, 201501)).await.unwrap();

        let path = wal_files(dir.path()).remove(0);
        let good_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"insert\",\"rec").unwrap();
        drop(file);

        let recovered = WriteAheadLog::new(dir.path()).unwrap();
        let mut entries = 0;
        let stats = recovered
            .replay(|_| {
                entries += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(entries, 1);
        assert!(stats.truncated_tail);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert!(recovered.verify().unwrap());
    }

    #[tokio::test]
    async fn test_wal_torn_multibyte_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path()).unwrap();
        let first = WalOp::Insert {
            record: Record::new(1, RecordKey::new("ili", 201501, Some("é")), 1.0),
        };
        wal.append(&first).await.unwrap();

        // Cut the next entry in the middle of its two-byte location
        let next = WalOp::Insert {
            record: Record::new(2, RecordKey::new("ili", 201502, Some("é")), 2.0),
        };
        let entry = encode_entry(&next).unwrap();
        let cut = entry.as_bytes().iter().position(|b| *b == 0xc3).unwrap() + 1;
        let path = wal_files(dir.path()).remove(0);
        let good_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&entry.as_bytes()[..cut]).unwrap();
        drop(file);

        let recovered = WriteAheadLog::new(dir.path()).unwrap();
        assert!(!recovered.verify().unwrap());
        let mut ops = Vec::new();
        let stats = recovered
            .replay(|op| {
                ops.push(op);
                Ok(())
            })
            .unwrap();
        assert_eq!(ops, vec![first]);
        assert!(stats.truncated_tail);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert!(recovered.verify().unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_entry() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path()).unwrap();
        wal.append(&insert_op(1, 201501)).await.unwrap();

        let (path, size) = {
            let segment = wal.current_segment.read().await;
            let segment = segment.as_ref().unwrap();
            (segment.path.clone(), segment.size)
        };
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let result = write_or_rollback(&file, size, |mut file| {
            file.write_all(b"{\"op\":\"insert\",\"rec")?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        });
        assert!(result.is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), size);

        wal.append(&insert_op(2, 201502)).await.unwrap();
        assert!(wal.verify().unwrap());
        assert_eq!(replay_all(&wal), vec![insert_op(1, 201501), insert_op(2, 201502)]);
    }

    #[tokio::test]
    async fn test_wal_compaction() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path())
            .unwrap()
            .with_max_segment_size(50);
        for i in 1..=5 {
            wal.append(&insert_op(i, 201500 + i as i32)).await.unwrap();
        }
        assert!(wal_files(dir.path()).len() > 1);

        let live = vec![Record::new(5, RecordKey::new("ili", 201505, Some("US")), 5.0)];
        wal.compact(live.clone(), 6).await.unwrap();

        assert_eq!(wal_files(dir.path()).len(), 1);
        assert_eq!(
            replay_all(&wal),
            vec![
                WalOp::Reserve { next_id: 6 },
                WalOp::Insert {
                    record: live[0].clone()
                }
            ]
        );

        // Appends after compaction land after the snapshot
        wal.append(&insert_op(6, 201506)).await.unwrap();
        assert_eq!(replay_all(&wal).len(), 3);
    }

    #[test]
    fn test_parse_sequence() {
        let path = PathBuf::from("/tmp/segment_0000000042_abc-def.wal");
        assert_eq!(parse_sequence(&path), Some(42));
        assert_eq!(parse_sequence(&PathBuf::from("/tmp/segment_0000000042_abc.tmp")), None);
        assert_eq!(parse_sequence(&PathBuf::from("/tmp/other.wal")), None);
    }
}
