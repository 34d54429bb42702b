//! Atomic JSON document persistence.

use clawbridge_error::{StorageError, StorageErrorKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, instrument};

/// One JSON document on disk, replaced atomically on every save.
///
/// Saves write a sibling `*.tmp` file, `fsync` it and rename it over the
/// target, so a crash or a failed write leaves the previous document intact.
#[derive(Debug, Clone, derive_getters::Getters)]
pub struct JsonStore {
    /// Path of the document
    path: PathBuf,
}

impl JsonStore {
    /// Store backed by `path`. Nothing is touched until the first load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the document, or `T::default()` when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` when the file exists but cannot be parsed, and `Io`
    /// when it cannot be read.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Document absent, starting empty");
                return Ok(T::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            error!(error = %e, "Stored document is unreadable");
            StorageError::new(StorageErrorKind::Corrupt {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
        })
    }

    /// Replace the document atomically.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` or `Io`; on error the previous document is untouched.
    #[instrument(skip(self, value), fields(path = %self.path.display()))]
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError::new(StorageErrorKind::Serialization(e.to_string())))?;
        write_atomically(&self.path, &bytes)?;
        debug!(bytes = bytes.len(), "Document saved");
        Ok(())
    }
}

/// Write `bytes` to `path` through a temporary sibling and a rename.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    let result = (|| -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            // Persist the rename itself; not every platform allows opening a directory.
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
