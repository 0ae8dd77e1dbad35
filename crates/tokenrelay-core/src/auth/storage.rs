//! Durable key-value backends for the credential pair.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt token file: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keychain(#[from] keyring::Error),
}

/// A single change in a batch: `Some` sets the entry, `None` removes it.
pub type Change<'a> = (&'a str, Option<&'a str>);

/// String-keyed durable storage shared by every component that reads credentials.
///
/// `apply` receives every change of one logical write so that backends able
/// to commit a batch atomically (the file store) can do so.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn apply(&self, changes: &[Change<'_>]) -> Result<(), StorageError>;
}

// ============================================================================
// File backend
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    entries: BTreeMap<String, String>,
    saved_at: Option<DateTime<Utc>>,
}

/// JSON file holding the entries, written via temp file + rename.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the file was last written, if it exists
    pub fn saved_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.read_file()?.saved_at)
    }

    fn read_file(&self) -> Result<TokenFile, StorageError> {
        if !self.path.exists() {
            return Ok(TokenFile::default());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_file(&self, file: &TokenFile) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_file()?.entries.get(key).cloned())
    }

    fn apply(&self, changes: &[Change<'_>]) -> Result<(), StorageError> {
        // An unreadable file is replaced, otherwise it would block every later write
        let mut file = match self.read_file() {
            Ok(file) => file,
            Err(StorageError::Format(e)) => {
                warn!(path = %self.path.display(), error = %e, "Discarding corrupt token file");
                TokenFile::default()
            }
            Err(e) => return Err(e),
        };
        for (key, value) in changes {
            match value {
                Some(v) => {
                    file.entries.insert((*key).to_string(), (*v).to_string());
                }
                None => {
                    file.entries.remove(*key);
                }
            }
        }

        if file.entries.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
                debug!(path = %self.path.display(), "Token file removed");
            }
            return Ok(());
        }

        file.saved_at = Some(Utc::now());
        self.write_file(&file)?;
        debug!(path = %self.path.display(), entries = file.entries.len(), "Token file saved");
        Ok(())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-local store. Used when persistence is unwanted and in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed entries, e.g. to simulate a previous run
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            entries: Mutex::new(map),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn apply(&self, changes: &[Change<'_>]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in changes {
            match value {
                Some(v) => {
                    entries.insert((*key).to_string(), (*v).to_string());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}
