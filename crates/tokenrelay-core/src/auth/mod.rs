//! Credential ownership and session recovery.
//!
//! This module provides:
//! - `CredentialStore`: the single owner of the access/refresh token pair
//! - `RefreshCoordinator`: single-flight exchange of a refresh token for a new pair
//! - Durable backends: `FileStore`, `KeychainStore`, `MemoryStore`
//!
//! The pair is persisted under the `access_token` and `refresh_token` keys.

pub mod credentials;
pub mod keychain;
pub mod refresh;
pub mod storage;

pub use credentials::{Credential, CredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
pub use keychain::KeychainStore;
pub use refresh::{
    HttpRefreshExchange, RefreshCoordinator, RefreshError, RefreshExchange, RefreshFailure,
    REFRESH_PATH,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
