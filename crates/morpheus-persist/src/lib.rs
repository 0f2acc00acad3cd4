//! Crash-safe JSON persistence for the Morpheus registry.
//!
//! Generalizes the teacher's `JsonStore` (load/save a typed map to a single
//! JSON file under a state directory) with two properties the registry's
//! durability contract requires that the original did not provide:
//! writes are atomic (tempfile + fsync + rename, never a partial file) and
//! a process can take an advisory exclusive lock on the store before
//! mutating it.

#![forbid(unsafe_code)]

use fs4::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not acquire lock on {0}")]
    LockUnavailable(PathBuf),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Reads and atomically writes a single JSON document at a fixed path.
///
/// One `JsonStore` per named domain (`registry`, `config`), mirroring the
/// teacher's `{state_path}/state/{domain}.json` layout.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(state_dir: impl AsRef<Path>, domain: &str) -> Self {
        let path = state_dir.as_ref().join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Uses `path` exactly as given, with no directory/domain composition.
    /// For callers (like `Registry::open`) that already resolved the exact
    /// file a document belongs at, rather than a directory to lay one out under.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and deserializes the store's contents. Returns `T::default()`
    /// if the file does not exist yet; a corrupt file is logged and treated
    /// the same way rather than propagated, matching the teacher's
    /// tolerant-on-read behavior.
    pub fn load<T>(&self) -> T
    where
        T: Default + serde::de::DeserializeOwned,
    {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "store file absent, starting empty");
                return T::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read store, starting empty");
                return T::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "store contents corrupt, starting empty");
                T::default()
            }
        }
    }

    /// Serializes `value` and writes it atomically: the data lands in a
    /// sibling tempfile, is fsynced, then renamed over the target path.
    /// A crash mid-write leaves either the old file or the new one intact,
    /// never a half-written one.
    pub fn save<T: serde::Serialize>(&self, value: &T) -> PersistResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| PersistError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;

        let json = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Json {
            path: self.path.clone(),
            source: e,
        })?;

        let tmp_path = parent.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("store")
        ));

        let mut tmp = File::create(&tmp_path).map_err(|e| PersistError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        tmp.write_all(&json).map_err(|e| PersistError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        tmp.sync_all().map_err(|e| PersistError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| PersistError::Io {
            path: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }
}

/// Advisory exclusive lock on a store's backing file, guarding cross-process
/// access per the registry's single-writer expectation. Held for the
/// lifetime of the returned guard.
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    /// Blocks until the lock is acquired.
    pub fn acquire(store: &JsonStore) -> PersistResult<Self> {
        let parent = store.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| PersistError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
        let lock_path = parent.join(format!(
            ".{}.lock",
            store
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("store")
        ));
        let file = File::create(&lock_path).map_err(|e| PersistError::Io {
            path: lock_path.clone(),
            source: e,
        })?;
        file.lock_exclusive()
            .map_err(|_| PersistError::LockUnavailable(lock_path.clone()))?;
        Ok(Self { _file: file })
    }

    /// Non-blocking variant; returns `None` if another process holds it.
    pub fn try_acquire(store: &JsonStore) -> PersistResult<Option<Self>> {
        let parent = store.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| PersistError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
        let lock_path = parent.join(format!(
            ".{}.lock",
            store
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("store")
        ));
        let file = File::create(&lock_path).map_err(|e| PersistError::Io {
            path: lock_path.clone(),
            source: e,
        })?;
        if file.try_lock_exclusive().is_ok() {
            Ok(Some(Self { _file: file }))
        } else {
            Ok(None)
        }
    }
}
