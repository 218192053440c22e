//! Persistence hooks for conversation trees.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::core::config::data::path_display;
use crate::core::config::io::write_atomically;
use crate::core::tree::TreeSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid tree key '{0}'")]
    InvalidKey(String),

    #[error("I/O error at {}: {source}", path_display(.path))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed tree file {}: {source}", path_display(.path))]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode tree: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Loads and saves one tree snapshot per key (a character id).
pub trait TreeStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved under `key` yet.
    fn load(&self, key: &str) -> Result<Option<TreeSnapshot>, StoreError>;

    fn save(&self, key: &str, snapshot: &TreeSnapshot) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct JsonTreeStore {
    dir: PathBuf,
}

impl JsonTreeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl TreeStore for JsonTreeStore {
    fn load(&self, key: &str) -> Result<Option<TreeSnapshot>, StoreError> {
        let path = self.path_for(key)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let snapshot =
            serde_json::from_str(&contents).map_err(|source| StoreError::Format {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path_display(&path), "loaded conversation tree");
        Ok(Some(snapshot))
    }

    fn save(&self, key: &str, snapshot: &TreeSnapshot) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let contents = serde_json::to_vec_pretty(snapshot).map_err(StoreError::Encode)?;
        write_atomically(&path, &contents).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path_display(&path), messages = snapshot.messages.len(), "saved conversation tree");
        Ok(())
    }
}

/// Keeps snapshots in memory; for tests and sessions that should not persist.
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    snapshots: Mutex<HashMap<String, TreeSnapshot>>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl TreeStore for MemoryTreeStore {
    fn load(&self, key: &str) -> Result<Option<TreeSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned())
    }

    fn save(&self, key: &str, snapshot: &TreeSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), snapshot.clone());
        Ok(())
    }
}
