use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use super::storage::{KeyValueStore, MemoryStore, StorageError};
use crate::models::TokenPair;

/// Durable entry holding the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Durable entry holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Authentication state of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

impl From<TokenPair> for Credential {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: Some(pair.access_token),
            refresh_token: Some(pair.refresh_token),
        }
    }
}

/// Single owner of the credential pair.
///
/// The in-memory pair and its durable entries change together under one
/// write lock, so readers see either the old pair or the new one.
pub struct CredentialStore {
    current: RwLock<Credential>,
    backend: Box<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Hydrate from durable storage.
    ///
    /// Unreadable storage and a lone entry without its companion both start
    /// the store logged out.
    pub fn load(backend: impl KeyValueStore + 'static) -> Self {
        let access = backend.get(ACCESS_TOKEN_KEY);
        let refresh = backend.get(REFRESH_TOKEN_KEY);

        let current = match (access, refresh) {
            (Ok(Some(access)), Ok(Some(refresh))) => {
                debug!("Credentials loaded from storage");
                Credential::new(access, refresh)
            }
            (Ok(None), Ok(None)) => Credential::default(),
            (Ok(_), Ok(_)) => {
                warn!("Discarding incomplete credential pair from storage");
                let removal = [(ACCESS_TOKEN_KEY, None), (REFRESH_TOKEN_KEY, None)];
                if let Err(e) = backend.apply(&removal) {
                    warn!(error = %e, "Failed to remove incomplete credential pair");
                }
                Credential::default()
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to load credentials, starting logged out");
                Credential::default()
            }
        };

        Self {
            current: RwLock::new(current),
            backend: Box::new(backend),
        }
    }

    /// Store backed by process memory only
    pub fn in_memory() -> Self {
        Self::load(MemoryStore::new())
    }

    /// Current pair; both-absent if never set
    pub fn read(&self) -> Credential {
        self.read_lock().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_lock().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_lock().refresh_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_lock().access_token.is_some()
    }

    /// Replace both fields and persist them. An absent field removes its entry.
    ///
    /// The in-memory pair is replaced even when persisting fails; the error is
    /// still returned.
    pub fn write(&self, credential: Credential) -> Result<(), StorageError> {
        let mut current = self.write_lock();
        let changes = [
            (ACCESS_TOKEN_KEY, credential.access_token.as_deref()),
            (REFRESH_TOKEN_KEY, credential.refresh_token.as_deref()),
        ];
        let result = self.backend.apply(&changes);
        *current = credential;

        if let Err(ref e) = result {
            warn!(error = %e, "Failed to persist credentials");
        }
        result
    }

    /// Store a pair issued by login or refresh
    pub fn store_pair(&self, pair: &TokenPair) -> Result<(), StorageError> {
        self.write(Credential::from(pair.clone()))
    }

    /// Forget both tokens. Returns whether anything was held.
    pub fn clear(&self) -> Result<bool, StorageError> {
        let mut current = self.write_lock();
        let had_credentials = !current.is_empty();
        *current = Credential::default();

        let result = self
            .backend
            .apply(&[(ACCESS_TOKEN_KEY, None), (REFRESH_TOKEN_KEY, None)]);
        if let Err(ref e) = result {
            warn!(error = %e, "Failed to remove persisted credentials");
        }
        result.map(|()| had_credentials)
    }

    // A poisoned lock still holds a whole pair; writers never leave it half-set.
    fn read_lock(&self) -> RwLockReadGuard<'_, Credential> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Credential> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}
