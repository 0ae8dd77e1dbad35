//! Wire models for the backend REST API.
//!
//! This module contains the request and response shapes exchanged with
//! the backend:
//!
//! - `TokenPair`: access/refresh credentials returned by login and refresh
//! - `Envelope<T>`: the `{code, message, data}` wrapper on business endpoints
//! - Account types: `LoginRequest`, `RegisteredUser`, `UserInfo`
//! - `SessionInfo`: analysis sessions owned by the user

pub mod auth;
pub mod envelope;
pub mod session;

pub use auth::{LoginRequest, RefreshRequest, RegisteredUser, TokenPair, UserInfo};
pub use envelope::{Envelope, SUCCESS_CODE};
pub use session::{CleanRequest, SessionInfo, SessionRename};
