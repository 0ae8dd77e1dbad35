//! REST API access for the backend.
//!
//! This module provides the `ApiClient` request pipeline: bearer token
//! injection on the way out, 401 recovery through a single shared token
//! refresh on the way back. Typed endpoint wrappers live in `endpoints`.
//!
//! Business endpoints answer with a `{code, message, data}` envelope where
//! `code == 200` means success regardless of HTTP status.

pub mod client;
pub mod endpoints;
pub mod error;
pub mod transport;

pub use client::{ApiClient, LogNotifier, Notifier, SESSION_EXPIRED_MESSAGE};
pub use error::{ApiError, TransportError};
pub use transport::{ApiRequest, ApiResponse, RequestBody, ReqwestTransport, Transport};
