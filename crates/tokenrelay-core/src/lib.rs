//! tokenrelay core - authenticated HTTP access for a browser-style client.
//!
//! Provides the request pipeline that attaches bearer tokens and recovers
//! from expired sessions, the single-flight token refresh it relies on, the
//! persisted credential store, and the navigation guard in front of
//! protected routes.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod router;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse};
pub use auth::{Credential, CredentialStore, RefreshCoordinator};
pub use config::ClientConfig;
pub use router::{NavigationGuard, Router};
