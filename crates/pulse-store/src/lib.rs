//! Named collection store for the Pulse SDK core.
//!
//! A collection is a flat key→value map persisted as one JSON file at
//! `<base>/com.pulse.datastore/<collection>.json`. Extensions use
//! collections for bookkeeping (install dates, identifiers), the rules
//! pipeline uses one for its download cache, and the hub may use one for
//! its own records.
//!
//! Writes are atomic: the new content goes to a sibling temp file which is
//! then renamed over the target, so readers never observe a torn file.
//! A file that fails to parse is treated as absent rather than fatal.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory component under the base dir that namespaces all collections.
const DATASTORE_DIR: &str = "com.pulse.datastore";

/// Errors that can occur during collection store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("datastore io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("datastore serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Factory for named collections rooted at one base directory.
#[derive(Debug, Clone)]
pub struct CollectionStore {
    root: PathBuf,
}

impl CollectionStore {
    /// Opens (and creates, if needed) the datastore directory under `base`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn open(base: &Path) -> Result<Self, StoreError> {
        let root = base.join(DATASTORE_DIR);
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns a handle to the named collection. The backing file is created
    /// lazily on first write.
    pub fn collection(&self, name: &str) -> NamedCollection {
        NamedCollection {
            path: self.root.join(format!("{name}.json")),
        }
    }
}

/// A single named key→value collection backed by one JSON file.
#[derive(Debug, Clone)]
pub struct NamedCollection {
    path: PathBuf,
}

impl NamedCollection {
    /// Reads the value stored under `key`, or `None` if absent.
    ///
    /// A missing or unparseable file reads as an empty collection.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.load().get(key).cloned()
    }

    /// Stores `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the file cannot be written.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut map = self.load();
        map.insert(key.to_string(), value);
        self.persist(&map)
    }

    /// Removes the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the file cannot be written.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.load();
        if map.remove(key).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }

    /// Deletes the entire collection file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file exists but cannot be removed.
    pub fn remove_all(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.load().len()
    }

    /// Whether the collection holds no keys.
    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    fn load(&self) -> Map<String, Value> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to read collection");
                }
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(path = %self.path.display(), "corrupt collection file, treating as empty");
                Map::new()
            }
        }
    }

    // Write-then-rename keeps the on-disk file whole under crashes.
    fn persist(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec(&Value::Object(map.clone()))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
