// Persistent log
// Durable, ordered, append-only storage of opaque entries on RocksDB.
// Every mutation is a single synced WriteBatch that also carries the updated
// next index and byte size, so a crash never exposes a partial append.

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use raftable_api::DatabaseError;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch, WriteOptions};
use tracing::{debug, info};

// Column family names
const CF_ENTRIES: &str = "entries";
const CF_META: &str = "meta";

// Meta keys
const KEY_NEXT_INDEX: &[u8] = b"next_index";
const KEY_SIZE: &[u8] = b"size";
const USER_META_PREFIX: &str = "user:";

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("log is not open")]
    NotOpen,

    #[error("entries {from}..={to} are outside the log bounds {bounds}")]
    IndexOutOfRange { from: u64, to: u64, bounds: String },

    #[error("rocksdb error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("corrupted log: {0}")]
    Corrupted(String),
}

impl From<LogError> for DatabaseError {
    fn from(e: LogError) -> Self {
        DatabaseError::Storage(e.to_string())
    }
}

pub type LogResult<T> = Result<T, LogError>;

#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Index assigned to the first entry of a fresh log
    pub initial_index: u64,
    /// fsync every write batch
    pub sync_writes: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            initial_index: 1,
            sync_writes: true,
        }
    }
}

fn index_key(index: u64) -> [u8; 8] {
    let mut key = [0u8; 8];
    BigEndian::write_u64(&mut key, index);
    key
}

fn decode_index(key: &[u8]) -> LogResult<u64> {
    if key.len() != 8 {
        return Err(LogError::Corrupted(format!("entry key of {} bytes", key.len())));
    }
    Ok(BigEndian::read_u64(key))
}

struct OpenLog {
    db: DB,
    first_index: Option<u64>,
    next_index: u64,
    size: u64,
}

impl OpenLog {
    fn last_index(&self) -> Option<u64> {
        self.first_index.map(|_| self.next_index - 1)
    }

    fn bounds(&self) -> String {
        match (self.first_index, self.last_index()) {
            (Some(first), Some(last)) => format!("{}..={}", first, last),
            _ => "(empty)".to_string(),
        }
    }

    fn entries(&self) -> LogResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_ENTRIES)
            .ok_or_else(|| LogError::Corrupted("missing entries column family".to_string()))
    }

    fn meta(&self) -> LogResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_META)
            .ok_or_else(|| LogError::Corrupted("missing meta column family".to_string()))
    }

    /// Stages the bookkeeping keys into `batch`
    fn stage_bookkeeping(&self, batch: &mut WriteBatch, next_index: u64, size: u64) -> LogResult<()> {
        let meta = self.meta()?;
        batch.put_cf(meta, KEY_NEXT_INDEX, next_index.to_be_bytes());
        batch.put_cf(meta, KEY_SIZE, size.to_be_bytes());
        Ok(())
    }

    fn write(&self, batch: WriteBatch, sync: bool) -> LogResult<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(sync);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    /// Keys and value sizes of every entry with index >= `from` (or < `from` if `below`)
    fn scan(&self, from: u64, below: bool) -> LogResult<Vec<(u64, u64)>> {
        let cf = self.entries()?;
        let start = index_key(from);
        let mode = if below {
            IteratorMode::Start
        } else {
            IteratorMode::From(&start[..], Direction::Forward)
        };
        let mut found = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            let index = decode_index(&key)?;
            if below && index >= from {
                break;
            }
            found.push((index, value.len() as u64));
        }
        Ok(found)
    }
}

fn read_u64(db: &DB, cf: &rocksdb::ColumnFamily, key: &[u8]) -> LogResult<Option<u64>> {
    match db.get_cf(cf, key)? {
        Some(bytes) if bytes.len() == 8 => Ok(Some(BigEndian::read_u64(&bytes))),
        Some(bytes) => Err(LogError::Corrupted(format!(
            "meta value of {} bytes",
            bytes.len()
        ))),
        None => Ok(None),
    }
}

/// Durable append-only log
///
/// Indices are contiguous: appends are assigned `last_index + 1`, or the
/// configured initial index on a fresh log. Operations on one instance are
/// serialized by an internal lock.
pub struct ConsensusLog {
    path: PathBuf,
    options: LogOptions,
    inner: Mutex<Option<OpenLog>>,
}

impl ConsensusLog {
    pub fn new(path: impl AsRef<Path>, options: LogOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            inner: Mutex::new(None),
        }
    }

    /// Creates and opens a log
    pub fn open_at(path: impl AsRef<Path>, options: LogOptions) -> LogResult<Self> {
        let log = Self::new(path, options);
        log.open()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Ok(());
        }

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&db_opts, &self.path, cfs)?;

        let mut log = OpenLog {
            db,
            first_index: None,
            next_index: self.options.initial_index,
            size: 0,
        };

        let (first, last) = {
            let cf = log.entries()?;
            let first = match log.db.iterator_cf(cf, IteratorMode::Start).next() {
                Some(item) => Some(decode_index(&item?.0)?),
                None => None,
            };
            let last = match log.db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => Some(decode_index(&item?.0)?),
                None => None,
            };
            (first, last)
        };
        let meta = log.meta()?;
        let stored_next = read_u64(&log.db, meta, KEY_NEXT_INDEX)?;
        let stored_size = read_u64(&log.db, meta, KEY_SIZE)?;

        log.first_index = first;
        log.next_index = match (stored_next, last) {
            (Some(next), Some(last)) => next.max(last + 1),
            (Some(next), None) => next,
            (None, Some(last)) => last + 1,
            (None, None) => self.options.initial_index,
        };
        log.size = match stored_size {
            Some(size) => size,
            None => log.scan(0, false)?.iter().map(|(_, len)| len).sum(),
        };

        info!(
            path = %self.path.display(),
            bounds = %log.bounds(),
            size = log.size,
            "Opened persistent log"
        );
        metrics::gauge!("raftable_log_size_bytes").set(log.size as f64);
        *inner = Some(log);
        Ok(())
    }

    /// Closes the underlying database; the log can be reopened later
    pub fn close(&self) {
        if self.inner.lock().take().is_some() {
            info!(path = %self.path.display(), "Closed persistent log");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut OpenLog) -> LogResult<T>) -> LogResult<T> {
        let mut inner = self.inner.lock();
        let log = inner.as_mut().ok_or(LogError::NotOpen)?;
        f(log)
    }

    pub fn first_index(&self) -> LogResult<Option<u64>> {
        self.with_log(|log| Ok(log.first_index))
    }

    pub fn last_index(&self) -> LogResult<Option<u64>> {
        self.with_log(|log| Ok(log.last_index()))
    }

    /// Index the next append will be assigned
    pub fn next_index(&self) -> LogResult<u64> {
        self.with_log(|log| Ok(log.next_index))
    }

    pub fn is_empty(&self) -> LogResult<bool> {
        self.with_log(|log| Ok(log.first_index.is_none()))
    }

    /// Total bytes of stored entries
    pub fn size(&self) -> LogResult<u64> {
        self.with_log(|log| Ok(log.size))
    }

    pub fn append_entry(&self, entry: &[u8]) -> LogResult<u64> {
        let indices = self.append_entries(&[entry])?;
        indices
            .first()
            .copied()
            .ok_or_else(|| LogError::Corrupted("append assigned no index".to_string()))
    }

    /// Appends entries atomically, returning their indices in order
    pub fn append_entries<E: AsRef<[u8]>>(&self, entries: &[E]) -> LogResult<Vec<u64>> {
        let sync = self.options.sync_writes;
        self.with_log(|log| {
            if entries.is_empty() {
                return Ok(Vec::new());
            }
            let cf = log.entries()?;
            let mut batch = WriteBatch::default();
            let mut indices = Vec::with_capacity(entries.len());
            let mut added = 0u64;
            for (offset, entry) in entries.iter().enumerate() {
                let index = log.next_index + offset as u64;
                let entry = entry.as_ref();
                batch.put_cf(cf, index_key(index), entry);
                added += entry.len() as u64;
                indices.push(index);
            }
            let next_index = log.next_index + entries.len() as u64;
            let size = log.size + added;
            log.stage_bookkeeping(&mut batch, next_index, size)?;
            log.write(batch, sync)?;

            if log.first_index.is_none() {
                log.first_index = indices.first().copied();
            }
            log.next_index = next_index;
            log.size = size;
            metrics::gauge!("raftable_log_size_bytes").set(size as f64);
            debug!(first = indices[0], count = indices.len(), "Appended log entries");
            Ok(indices)
        })
    }

    pub fn contains_entry(&self, index: u64) -> LogResult<bool> {
        self.with_log(|log| {
            Ok(matches!((log.first_index, log.last_index()),
                (Some(first), Some(last)) if index >= first && index <= last))
        })
    }

    pub fn get_entry(&self, index: u64) -> LogResult<Option<Vec<u8>>> {
        self.with_log(|log| Ok(log.db.get_cf(log.entries()?, index_key(index))?))
    }

    /// Reads the inclusive range `from..=to`
    pub fn get_entries(&self, from: u64, to: u64) -> LogResult<Vec<Vec<u8>>> {
        self.with_log(|log| {
            let in_bounds = matches!((log.first_index, log.last_index()),
                (Some(first), Some(last)) if from >= first && to <= last && from <= to);
            if !in_bounds {
                return Err(LogError::IndexOutOfRange {
                    from,
                    to,
                    bounds: log.bounds(),
                });
            }

            let cf = log.entries()?;
            let start = index_key(from);
            let mut entries = Vec::with_capacity((to - from + 1) as usize);
            let mut expected = from;
            for item in log
                .db
                .iterator_cf(cf, IteratorMode::From(&start[..], Direction::Forward))
            {
                let (key, value) = item?;
                let index = decode_index(&key)?;
                if index > to {
                    break;
                }
                if index != expected {
                    return Err(LogError::Corrupted(format!(
                        "expected entry {} but found {}",
                        expected, index
                    )));
                }
                entries.push(value.to_vec());
                expected += 1;
            }
            if expected != to + 1 {
                return Err(LogError::Corrupted(format!("entry {} is missing", expected)));
            }
            Ok(entries)
        })
    }

    /// Removes every entry after `index`; the next append is assigned `index + 1`
    pub fn remove_after(&self, index: u64) -> LogResult<()> {
        match index.checked_add(1) {
            Some(from) => self.remove_from(from),
            None => Ok(()),
        }
    }

    /// Removes every entry at or after `index`; the next append is assigned `index`
    pub fn remove_from(&self, index: u64) -> LogResult<()> {
        let sync = self.options.sync_writes;
        self.with_log(|log| {
            if index >= log.next_index {
                return Ok(());
            }
            let removed = log.scan(index, false)?;
            let cf = log.entries()?;
            let mut batch = WriteBatch::default();
            let mut freed = 0u64;
            for (i, len) in &removed {
                batch.delete_cf(cf, index_key(*i));
                freed += len;
            }
            let size = log.size.saturating_sub(freed);
            log.stage_bookkeeping(&mut batch, index, size)?;
            log.write(batch, sync)?;

            log.next_index = index;
            log.size = size;
            if log.first_index.is_some_and(|first| first >= index) {
                log.first_index = None;
            }
            metrics::gauge!("raftable_log_size_bytes").set(size as f64);
            debug!(from = index, removed = removed.len(), "Removed log tail");
            Ok(())
        })
    }

    /// Drops every entry below `index` and stores `substitute` at `index`
    ///
    /// `index` may lie beyond the last entry, in which case the log is reset
    /// to the single substitute entry.
    pub fn compact(&self, index: u64, substitute: &[u8]) -> LogResult<()> {
        let sync = self.options.sync_writes;
        self.with_log(|log| {
            if let Some(first) = log.first_index
                && index < first
            {
                return Err(LogError::IndexOutOfRange {
                    from: index,
                    to: index,
                    bounds: log.bounds(),
                });
            }

            let above = index.saturating_add(1);
            let dropped = log.scan(above, true)?;
            let cf = log.entries()?;
            let mut batch = WriteBatch::default();
            let mut freed = 0u64;
            for (i, len) in &dropped {
                batch.delete_cf(cf, index_key(*i));
                freed += len;
            }
            batch.put_cf(cf, index_key(index), substitute);

            // Entries above `index` survive only if the log held any
            let next_index = if log.first_index.is_some() && index < log.next_index {
                log.next_index.max(above)
            } else {
                above
            };
            let size = log.size.saturating_sub(freed) + substitute.len() as u64;
            log.stage_bookkeeping(&mut batch, next_index, size)?;
            log.write(batch, sync)?;

            log.first_index = Some(index);
            log.next_index = next_index;
            log.size = size;
            metrics::gauge!("raftable_log_size_bytes").set(size as f64);
            debug!(index, dropped = dropped.len(), "Compacted log");
            Ok(())
        })
    }

    pub fn put_metadata(&self, key: &str, value: &[u8]) -> LogResult<()> {
        let sync = self.options.sync_writes;
        self.with_log(|log| {
            let mut batch = WriteBatch::default();
            batch.put_cf(log.meta()?, format!("{}{}", USER_META_PREFIX, key), value);
            log.write(batch, sync)
        })
    }

    pub fn get_metadata(&self, key: &str) -> LogResult<Option<Vec<u8>>> {
        self.with_log(|log| {
            Ok(log
                .db
                .get_cf(log.meta()?, format!("{}{}", USER_META_PREFIX, key))?)
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn open_log(dir: &TempDir) -> ConsensusLog {
        ConsensusLog::open_at(dir.path().join("log"), LogOptions::default()).unwrap()
    }

    #[test]
    fn test_append_assigns_contiguous_indices() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        assert_eq!(log.append_entry(b"a").unwrap(), 1);
        assert_eq!(log.append_entries(&[b"bb", b"cc"]).unwrap(), vec![2, 3]);
        assert_eq!(log.first_index().unwrap(), Some(1));
        assert_eq!(log.last_index().unwrap(), Some(3));
        assert_eq!(log.get_entry(2).unwrap(), Some(b"bb".to_vec()));
        assert_eq!(log.get_entry(9).unwrap(), None);
        assert!(log.contains_entry(3).unwrap());
        assert!(!log.contains_entry(4).unwrap());
    }

    #[test]
    fn test_size_counts_bytes_not_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        log.append_entries(&[vec![0u8; 10], vec![0u8; 5]]).unwrap();
        assert_eq!(log.size().unwrap(), 15);
        log.remove_after(1).unwrap();
        assert_eq!(log.size().unwrap(), 10);
    }

    #[test]
    fn test_get_entries_range_checks() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        // empty log
        assert!(matches!(
            log.get_entries(1, 1),
            Err(LogError::IndexOutOfRange { .. })
        ));

        log.append_entries(&[b"1", b"2", b"3"]).unwrap();
        assert_eq!(
            log.get_entries(2, 3).unwrap(),
            vec![b"2".to_vec(), b"3".to_vec()]
        );
        assert!(matches!(
            log.get_entries(0, 2),
            Err(LogError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            log.get_entries(2, 4),
            Err(LogError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_remove_after_rewinds_next_index() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        log.append_entries(&[b"1", b"2", b"3", b"4"]).unwrap();
        log.remove_after(2).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(2));
        assert_eq!(log.get_entry(3).unwrap(), None);

        // a diverged tail is replaced by the new leader's entries
        assert_eq!(log.append_entry(b"3'").unwrap(), 3);
        assert_eq!(log.get_entry(3).unwrap(), Some(b"3'".to_vec()));

        // removing everything leaves an empty log that continues at index 1
        log.remove_after(0).unwrap();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.append_entry(b"x").unwrap(), 1);
    }

    #[test]
    fn test_compact_replaces_prefix_with_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        log.append_entries(&[b"aaaa", b"bbbb", b"cccc", b"dddd"]).unwrap();
        log.compact(3, b"S").unwrap();

        assert_eq!(log.first_index().unwrap(), Some(3));
        assert_eq!(log.last_index().unwrap(), Some(4));
        assert_eq!(log.get_entry(3).unwrap(), Some(b"S".to_vec()));
        assert_eq!(log.get_entry(2).unwrap(), None);
        assert_eq!(log.size().unwrap(), 5);
        assert!(matches!(
            log.get_entries(2, 4),
            Err(LogError::IndexOutOfRange { .. })
        ));
        // compaction below the first index is rejected
        assert!(log.compact(1, b"S").is_err());
    }

    #[test]
    fn test_compact_beyond_last_resets_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        log.append_entries(&[b"a", b"b"]).unwrap();
        log.compact(10, b"S").unwrap();

        assert_eq!(log.first_index().unwrap(), Some(10));
        assert_eq!(log.last_index().unwrap(), Some(10));
        assert_eq!(log.append_entry(b"c").unwrap(), 11);
    }

    #[test]
    fn test_boundary_indices_on_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        log.append_entries(&[b"a", b"b"]).unwrap();
        log.remove_after(u64::MAX).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(2));

        // empty, but the next append would land at 10
        log.compact(10, b"S").unwrap();
        log.remove_after(9).unwrap();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.next_index().unwrap(), 10);

        log.compact(5, b"T").unwrap();
        assert_eq!(log.first_index().unwrap(), Some(5));
        assert_eq!(log.last_index().unwrap(), Some(5));
        assert_eq!(log.get_entries(5, 5).unwrap(), vec![b"T".to_vec()]);
        assert_eq!(log.append_entry(b"c").unwrap(), 6);
    }

    #[test]
    fn test_reopen_after_crash_sees_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(&dir);
            log.append_entries(&[&b"one"[..], b"two", b"three"]).unwrap();
            log.remove_after(2).unwrap();
            log.put_metadata("vote", b"v1").unwrap();
            // dropped without close
        }

        let log = open_log(&dir);
        assert_eq!(log.last_index().unwrap(), Some(2));
        assert_eq!(log.size().unwrap(), 6);
        assert_eq!(log.get_metadata("vote").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(log.append_entry(b"3").unwrap(), 3);
    }

    #[test]
    fn test_closed_log_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        log.close();
        assert!(!log.is_open());
        assert!(matches!(log.append_entry(b"x"), Err(LogError::NotOpen)));

        log.open().unwrap();
        assert_eq!(log.append_entry(b"x").unwrap(), 1);
    }

    #[test]
    fn test_initial_index_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConsensusLog::open_at(
            dir.path().join("log"),
            LogOptions {
                initial_index: 0,
                sync_writes: false,
            },
        )
        .unwrap();
        assert_eq!(log.append_entry(b"membership").unwrap(), 0);
        assert_eq!(log.first_index().unwrap(), Some(0));
    }

    #[test]
    fn test_concurrent_appends_keep_indices_unique() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(open_log(&dir));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| log.append_entry(format!("{}-{}", t, i).as_bytes()).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<u64>>());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(Vec<Vec<u8>>),
        RemoveAfter(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..4).prop_map(Op::Append),
            (0u64..12).prop_map(Op::RemoveAfter),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_log_matches_vector_model(ops in prop::collection::vec(op_strategy(), 1..20)) {
            let dir = tempfile::tempdir().unwrap();
            let log = ConsensusLog::open_at(
                dir.path().join("log"),
                LogOptions { initial_index: 1, sync_writes: false },
            ).unwrap();
            let mut model: Vec<Vec<u8>> = Vec::new();

            for op in ops {
                match op {
                    Op::Append(entries) => {
                        let indices = log.append_entries(&entries).unwrap();
                        let expected: Vec<u64> =
                            (model.len() as u64 + 1..=(model.len() + entries.len()) as u64).collect();
                        prop_assert_eq!(indices, expected);
                        model.extend(entries);
                    }
                    Op::RemoveAfter(index) => {
                        log.remove_after(index).unwrap();
                        model.truncate(index as usize);
                    }
                }
            }

            let size: u64 = model.iter().map(|e| e.len() as u64).sum();
            prop_assert_eq!(log.size().unwrap(), size);
            if model.is_empty() {
                prop_assert!(log.is_empty().unwrap());
            } else {
                prop_assert_eq!(log.get_entries(1, model.len() as u64).unwrap(), model);
            }
        }
    }
}
