use keyring::Entry;

use super::storage::{Change, KeyValueStore, StorageError};

const SERVICE_NAME: &str = "tokenrelay";

/// Stores each entry as a separate OS keychain item under one service name.
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for KeychainStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn apply(&self, changes: &[Change<'_>]) -> Result<(), StorageError> {
        for (key, value) in changes {
            let entry = self.entry(key)?;
            match value {
                Some(v) => entry.set_password(v)?,
                None => match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
}
