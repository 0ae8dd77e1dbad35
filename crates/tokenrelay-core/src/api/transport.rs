//! HTTP transport seam.
//!
//! `ApiRequest` is a replayable description of a call: the pipeline may send
//! the same request twice (before and after a token refresh), so bodies are
//! owned data rather than streams.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, multipart, Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::error::{ApiError, TransportError};
use crate::models::Envelope;

/// Sent in place of a token when none is held; unauthenticated endpoints accept it.
const ABSENT_TOKEN_MARKER: &str = "null";

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    /// Single-file multipart upload
    File {
        field: String,
        file_name: String,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the configured base URL
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Value of the `Authorization` header, filled in by the pipeline
    pub authorization: Option<String>,
    /// Whether a 401 on this call may trigger a token refresh
    pub refreshable: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            authorization: None,
            refreshable: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.body = RequestBody::File {
            field: field.into(),
            file_name: file_name.into(),
            bytes,
        };
        self
    }

    /// Set the `Authorization` header to `Bearer <token>`, or the absent-token
    /// marker when none is held.
    pub fn bearer(mut self, access_token: Option<&str>) -> Self {
        self.authorization = Some(format!(
            "Bearer {}",
            access_token.unwrap_or(ABSENT_TOKEN_MARKER)
        ));
        self
    }

    /// Credential endpoints answer 401 for bad input; never refresh on those.
    pub fn without_refresh(mut self) -> Self {
        self.refreshable = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON: {}", e)))
    }

    /// Decode the `{code, message, data}` wrapper, turning a non-200 code
    /// into `ApiError::Business`.
    pub fn envelope<T: DeserializeOwned>(&self) -> Result<Envelope<T>, ApiError> {
        let envelope: Envelope<T> = self.json()?;
        if !envelope.is_success() {
            return Err(ApiError::Business {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope)
    }
}

/// Executes one HTTP exchange. Never interprets status codes.
pub trait Transport: Send + Sync {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, TransportError>>;
}

/// `Transport` over a shared reqwest connection pool.
/// Clone is cheap - reqwest::Client uses Arc internally.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TransportError::from_reqwest(e, timeout_secs))?;

        Ok(Self {
            client,
            base_url: Self::normalize_base(base_url)?,
            timeout_secs,
        })
    }

    /// Ensure the base ends with `/` so relative joins keep its path.
    fn normalize_base(base_url: &str) -> Result<Url, TransportError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", base_url, e)))
    }

    pub fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", path, e)))
    }

    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self.client.request(request.method.clone(), url.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref value) = request.authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(ref value) => builder.json(value),
            RequestBody::File {
                ref field,
                ref file_name,
                ref bytes,
            } => {
                let part = multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                builder.multipart(multipart::Form::new().part(field.clone(), part))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout_secs))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout_secs))?;

        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "Response received");
        Ok(ApiResponse::new(status, body.to_vec()))
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, TransportError>> {
        self.execute(request).boxed()
    }
}
