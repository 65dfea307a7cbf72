//! File-backed keyed document store
//!
//! A collection is one JSON file shaped as `{"Content": [record, ...]}`,
//! pretty-printed with a 4-space indent. Records are free-form JSON objects;
//! callers pick which field acts as the key (the "uide") per operation.
//!
//! Every operation holds a per-file lock for its whole critical section, so a
//! read-modify-write such as [`DocumentStore::append`] never loses a
//! concurrent writer's update. Handles opened on the same file share the lock
//! through a process-wide registry. Writes go to a temporary file in the
//! target directory and are renamed into place, so readers never observe a
//! half-written collection.
//!
//! When several records share a key value, keyed operations act on the first
//! one in stored order.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// One stored document; key order is preserved on disk
pub type Record = Map<String, Value>;

/// Errors surfaced by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode collection {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode collection {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No record with {uide} = {value}")]
    NotFound { uide: String, value: Value },
    #[error("Record has no {uide} field")]
    MissingKey { uide: String },
}

#[derive(Deserialize)]
struct Collection {
    #[serde(rename = "Content", default)]
    content: Vec<Record>,
}

#[derive(Serialize)]
struct CollectionRef<'a> {
    #[serde(rename = "Content")]
    content: &'a [Record],
}

/// Live per-file locks; entries die with the last handle on their file
static LOCKS: Lazy<Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle on one collection file
#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl DocumentStore {
    /// Open a handle; the file is created lazily on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = registry_lock(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in insertion order; an absent or empty file is an empty collection
    pub fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        let _span = crate::store_span!(op = "read_all", path = %self.path.display()).entered();
        let _guard = self.lock();
        self.load()
    }

    /// Replace the whole collection
    pub fn write_all(&self, records: &[Record]) -> Result<(), StoreError> {
        let _span = crate::store_span!(op = "write_all", path = %self.path.display()).entered();
        let _guard = self.lock();
        self.save(records)
    }

    /// Add one record at the end, creating the collection if needed
    pub fn append(&self, record: Record) -> Result<(), StoreError> {
        let _span = crate::store_span!(op = "append", path = %self.path.display()).entered();
        let _guard = self.lock();

        let mut records = self.load()?;
        records.push(record);
        self.save(&records)?;
        debug!(count = records.len(), "Appended record");
        Ok(())
    }

    /// First record whose `uide` field equals `value`
    pub fn find_by_key(
        &self,
        uide: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Record>, StoreError> {
        let value = value.into();
        let _span = crate::store_span!(op = "find_by_key", path = %self.path.display(), uide).entered();
        let _guard = self.lock();

        let records = self.load()?;
        Ok(first_match(&records, &[(uide, &value)]).map(|i| records[i].clone()))
    }

    /// Alias of [`Self::find_by_key`]
    pub fn search_by_key(
        &self,
        uide: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Record>, StoreError> {
        self.find_by_key(uide, value)
    }

    /// Replace the first record whose `uide` matches `record`'s
    ///
    /// Strict update: fails with [`StoreError::NotFound`] and leaves the
    /// collection untouched when nothing matches.
    pub fn update_by_key(&self, record: Record, uide: &str) -> Result<(), StoreError> {
        self.update_by_keys(record, &[uide])
    }

    /// Replace the first record matching `record` on every field in `uides`
    pub fn update_by_keys(&self, record: Record, uides: &[&str]) -> Result<(), StoreError> {
        let _span = crate::store_span!(op = "update", path = %self.path.display(), keys = ?uides).entered();

        let mut criteria = Vec::with_capacity(uides.len());
        for uide in uides {
            let value = record.get(*uide).ok_or_else(|| StoreError::MissingKey {
                uide: uide.to_string(),
            })?;
            criteria.push((*uide, value));
        }

        let _guard = self.lock();
        let mut records = self.load()?;

        let Some(index) = first_match(&records, &criteria) else {
            let (uide, value) = criteria.first().map_or(("", Value::Null), |(u, v)| {
                (*u, (*v).clone())
            });
            return Err(StoreError::NotFound {
                uide: uide.to_string(),
                value,
            });
        };

        records[index] = record.clone();
        self.save(&records)?;
        debug!(index, "Updated record");
        Ok(())
    }

    /// Remove the first record whose `uide` field equals `value`
    ///
    /// Returns false, without touching the file, when nothing matches.
    pub fn remove_by_key(&self, value: impl Into<Value>, uide: &str) -> Result<bool, StoreError> {
        let value = value.into();
        let _span = crate::store_span!(op = "remove_by_key", path = %self.path.display(), uide).entered();
        let _guard = self.lock();

        let mut records = self.load()?;
        let Some(index) = first_match(&records, &[(uide, &value)]) else {
            return Ok(false);
        };

        records.remove(index);
        self.save(&records)?;
        debug!(index, "Removed record");
        Ok(true)
    }

    /// Whether a record equal to `record` is stored
    pub fn contains(&self, record: &Record) -> Result<bool, StoreError> {
        Ok(self.position(record)?.is_some())
    }

    /// Index of the first record equal to `record`
    pub fn position(&self, record: &Record) -> Result<Option<usize>, StoreError> {
        let _guard = self.lock();
        Ok(self.load()?.iter().position(|r| r == record))
    }

    /// Empty the collection; an absent file stays absent
    pub fn clear(&self) -> Result<(), StoreError> {
        let _span = crate::store_span!(op = "clear", path = %self.path.display()).entered();
        let _guard = self.lock();

        match fs::metadata(&self.path) {
            Ok(_) => self.save(&[]),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Remove the backing file; returns false when it was already absent
    pub fn delete(&self) -> Result<bool, StoreError> {
        let _span = crate::store_span!(op = "delete", path = %self.path.display()).entered();
        let _guard = self.lock();

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is (), so a poisoned lock carries no broken state
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<Vec<Record>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let decode = |source| StoreError::Decode {
            path: self.path.clone(),
            source,
        };

        let value: Value = serde_json::from_slice(&bytes).map_err(decode)?;
        if !value.is_object() {
            return Err(decode(serde::de::Error::custom(
                "expected an object with a Content list",
            )));
        }

        let collection: Collection = serde_json::from_value(value).map_err(decode)?;
        Ok(collection.content)
    }

    fn save(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        CollectionRef { content: records }
            .serialize(&mut serializer)
            .map_err(|source| StoreError::Encode {
                path: self.path.clone(),
                source,
            })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|source| self.io_error(source))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|source| self.io_error(source))?;
        temp.write_all(&buffer)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|source| self.io_error(source))?;
        temp.persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Index of the first record matching every `(field, value)` pair
///
/// Records lacking a field never match.
fn first_match(records: &[Record], criteria: &[(&str, &Value)]) -> Option<usize> {
    records.iter().position(|record| {
        criteria
            .iter()
            .all(|(field, value)| record.get(*field) == Some(*value))
    })
}

/// Shared lock for every handle on the same file
fn registry_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = lock_key(path);
    let mut locks = LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.retain(|_, lock| lock.strong_count() > 0);

    if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
        return lock;
    }
    let lock = Arc::new(Mutex::new(()));
    locks.insert(key, Arc::downgrade(&lock));
    lock
}

/// Registry key for a path, stable before and after its directories exist
///
/// The absolute path is normalised lexically, then its longest existing
/// ancestor is canonicalised and the missing tail appended.
fn lock_key(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(e) => {
                warn!("Cannot resolve working directory for store lock: {}", e);
                path.to_path_buf()
            }
        }
    };
    let normalized = normalize(&absolute);

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return tail.iter().rev().fold(canonical, |key, name| key.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Drop `.` and fold `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
