//! Durable keyed tables on top of record logs.
//!
//! A [`SyncStore`] is either purely in memory or a locked directory holding
//! one log file per table:
//!
//! ```text
//! <dir>/
//! ├── LOCK             # advisory exclusive lock
//! ├── operations.log   # pending operation queue
//! ├── conflicts.log    # conflict records
//! └── vaults.log       # per-vault sync state
//! ```
//!
//! Every mutation is appended to the table's log before the in-memory copy
//! changes, so a failed write leaves the table as it was.

use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use vaultsync_storage::{
    FileBackend, InMemoryBackend, RecordLog, RecordSealer, SealingKey, StorageBackend,
};

const LOCK_FILE: &str = "LOCK";

/// Table file names.
pub(crate) const OPERATIONS_TABLE: &str = "operations";
pub(crate) const CONFLICTS_TABLE: &str = "conflicts";
pub(crate) const VAULTS_TABLE: &str = "vaults";

/// A row type stored in a [`Table`].
pub(crate) trait Keyed: Serialize + DeserializeOwned + Clone {
    /// Primary key.
    type Key: Ord + Clone + Serialize + DeserializeOwned;

    /// Returns the row's key.
    fn key(&self) -> Self::Key;
}

#[derive(Serialize, Deserialize)]
enum Entry<K, V> {
    Put(V),
    Remove(K),
}

#[derive(Debug)]
struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    fn open(path: &Path) -> SyncResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{name}.log"))
    }
}

/// Where the engine keeps its durable state.
#[derive(Debug, Clone)]
pub struct SyncStore {
    dir: Option<Arc<StoreDir>>,
    sealing_key: Option<SealingKey>,
    config: StoreConfig,
}

impl SyncStore {
    /// A store that forgets everything when dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            sealing_key: None,
            config: StoreConfig::default(),
        }
    }

    /// Opens (creating if needed) a directory store and takes its lock.
    ///
    /// With a `sealing_key`, every record is encrypted at rest.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreLocked`] if another process holds the
    /// directory, or an I/O error.
    pub fn open(path: &Path, sealing_key: Option<SealingKey>, config: StoreConfig) -> SyncResult<Self> {
        let dir = StoreDir::open(path)?;
        debug!(path = %path.display(), sealed = sealing_key.is_some(), "opened sync store");
        Ok(Self {
            dir: Some(Arc::new(dir)),
            sealing_key,
            config,
        })
    }

    /// Directory of a persistent store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref().map(|dir| dir.path.as_path())
    }

    /// Whether records are sealed at rest.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealing_key.is_some()
    }

    pub(crate) fn open_table<V: Keyed>(&self, name: &'static str) -> SyncResult<Table<V>> {
        let sealer = || self.sealing_key.as_ref().map(RecordSealer::new);
        let backend: Box<dyn StorageBackend> = match &self.dir {
            Some(dir) => Box::new(FileBackend::open(&dir.table_path(name))?),
            None => Box::new(InMemoryBackend::new()),
        };

        let (log, replay) = RecordLog::open(backend, sealer())?;
        if replay.discarded_bytes > 0 {
            warn!(
                table = name,
                bytes = replay.discarded_bytes,
                "discarded torn tail of table log"
            );
        }

        let mut rows = BTreeMap::new();
        for record in &replay.records {
            match decode::<Entry<V::Key, V>>(record)? {
                Entry::Put(row) => {
                    rows.insert(row.key(), row);
                }
                Entry::Remove(key) => {
                    rows.remove(&key);
                }
            }
        }
        debug!(table = name, rows = rows.len(), frames = log.frame_count(), "loaded table");

        Ok(Table {
            name,
            rows,
            log,
            dir: self.dir.clone(),
            config: self.config.clone(),
        })
    }
}

/// An ordered map whose every change is logged.
pub(crate) struct Table<V: Keyed> {
    name: &'static str,
    rows: BTreeMap<V::Key, V>,
    log: RecordLog,
    dir: Option<Arc<StoreDir>>,
    config: StoreConfig,
}

impl<V: Keyed> Table<V> {
    pub(crate) fn get(&self, key: &V::Key) -> Option<&V> {
        self.rows.get(key)
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Inserts or replaces a row.
    pub(crate) fn put(&mut self, row: V) -> SyncResult<()> {
        self.write(&Entry::<&V::Key, &V>::Put(&row))?;
        self.rows.insert(row.key(), row);
        self.maybe_compact()
    }

    /// Removes a row, returning it.
    pub(crate) fn remove(&mut self, key: &V::Key) -> SyncResult<Option<V>> {
        if !self.rows.contains_key(key) {
            return Ok(None);
        }
        self.write(&Entry::<&V::Key, &V>::Remove(key))?;
        let removed = self.rows.remove(key);
        self.maybe_compact()?;
        Ok(removed)
    }

    fn write(&mut self, entry: &Entry<&V::Key, &V>) -> SyncResult<()> {
        let bytes = encode(entry)?;
        self.log.append(&bytes)?;
        if self.config.sync_on_write {
            self.log.sync()?;
        }
        Ok(())
    }

    fn maybe_compact(&mut self) -> SyncResult<()> {
        let dead = self.log.frame_count().saturating_sub(self.rows.len() as u64);
        if dead <= self.config.compact_after {
            return Ok(());
        }
        self.compact()
    }

    /// Rewrites the log with only the live rows.
    pub(crate) fn compact(&mut self) -> SyncResult<()> {
        let records = self
            .rows
            .values()
            .map(|row| encode(&Entry::<&V::Key, &V>::Put(row)))
            .collect::<SyncResult<Vec<_>>>()?;
        let before = self.log.frame_count();

        match &self.dir {
            Some(dir) => {
                let path = dir.table_path(self.name);
                let tmp = path.with_extension("log.compact");
                if tmp.exists() {
                    fs::remove_file(&tmp)?;
                }
                let fresh = Box::new(FileBackend::open(&tmp)?);
                self.log
                    .compact_into(fresh, records.iter().map(Vec::as_slice))?;
                fs::rename(&tmp, &path)?;
            }
            None => {
                self.log.compact_into(
                    Box::new(InMemoryBackend::new()),
                    records.iter().map(Vec::as_slice),
                )?;
            }
        }

        debug!(
            table = self.name,
            before,
            after = self.log.frame_count(),
            "compacted table log"
        );
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn frame_count(&self) -> u64 {
        self.log.frame_count()
    }
}

fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| SyncError::codec(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::codec(e.to_string()))
}
