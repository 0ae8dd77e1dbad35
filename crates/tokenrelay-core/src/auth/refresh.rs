//! Single-flight token refresh.
//!
//! However many requests fail with 401 at once, only one `auth/refresh`
//! exchange is in flight; every caller that arrives while it is pending
//! awaits the same shared outcome. The exchange runs as its own task, so a
//! caller that gives up waiting does not stall it for the others.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialStore};
use crate::api::transport::{ApiRequest, Transport};
use crate::api::TransportError;
use crate::models::{Envelope, RefreshRequest, TokenPair};

/// Endpoint exchanging a refresh token for a new pair
pub const REFRESH_PATH: &str = "auth/refresh";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Refresh endpoint returned status {0}")]
    Status(u16),

    #[error("Refresh rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Refresh task did not complete: {0}")]
    Interrupted(String),
}

/// Outcome shared by every caller that joined a failed exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Token refresh failed: {reason}")]
pub struct RefreshFailure {
    /// Identifies the exchange; callers that joined the same one share it
    pub flight: u64,
    pub reason: RefreshError,
}

/// Performs the network exchange. The returned future owns everything it
/// needs so it can outlive the caller that started it.
pub trait RefreshExchange: Send + Sync {
    /// `access_token` is the one held when the exchange started, if any.
    fn exchange(
        &self,
        refresh_token: String,
        access_token: Option<String>,
    ) -> BoxFuture<'static, Result<TokenPair, RefreshError>>;
}

/// `RefreshExchange` posting `{refresh_token}` to `auth/refresh`.
///
/// Goes straight to the transport; a refresh must never pass back through
/// the pipeline that is waiting on it.
pub struct HttpRefreshExchange {
    transport: Arc<dyn Transport>,
}

impl HttpRefreshExchange {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl RefreshExchange for HttpRefreshExchange {
    fn exchange(
        &self,
        refresh_token: String,
        access_token: Option<String>,
    ) -> BoxFuture<'static, Result<TokenPair, RefreshError>> {
        let transport = Arc::clone(&self.transport);
        async move {
            let request = ApiRequest::post(REFRESH_PATH)
                .json(&RefreshRequest {
                    refresh_token: &refresh_token,
                })
                .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?
                .bearer(access_token.as_deref())
                .without_refresh();

            let response = transport.send(request).await?;
            if !response.status().is_success() {
                return Err(RefreshError::Status(response.status().as_u16()));
            }

            let envelope = response
                .json::<Envelope<TokenPair>>()
                .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
            if !envelope.is_success() {
                return Err(RefreshError::Rejected {
                    code: envelope.code,
                    message: envelope.message,
                });
            }
            envelope
                .data
                .ok_or_else(|| RefreshError::InvalidResponse("missing token data".to_string()))
        }
        .boxed()
    }
}

type Outcome = Result<TokenPair, RefreshFailure>;
type Flight = Shared<BoxFuture<'static, Outcome>>;

/// Last exchange to settle, keyed by the access token it was meant to replace
struct Settled {
    replaced: Option<String>,
    outcome: Outcome,
}

#[derive(Default)]
struct RefreshState {
    /// Present exactly while an exchange is unresolved
    pending: Option<Flight>,
    last_flight: u64,
    settled: Option<Settled>,
}

/// Guarantees at most one refresh exchange in flight per instance.
///
/// Only returns the exchanged pair; writing it to the `CredentialStore` is
/// the caller's job. Must be used from within a Tokio runtime.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    exchange: Arc<dyn RefreshExchange>,
    state: Arc<Mutex<RefreshState>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, exchange: Arc<dyn RefreshExchange>) -> Self {
        Self {
            store,
            exchange,
            state: Arc::new(Mutex::new(RefreshState::default())),
        }
    }

    /// Start an exchange, or join the one already pending.
    pub async fn refresh(&self) -> Result<TokenPair, RefreshFailure> {
        self.join_or_start(None).await
    }

    /// Like `refresh`, for a caller whose request was rejected while
    /// carrying `rejected_access_token`.
    ///
    /// If the last settled exchange already replaced that token, its outcome
    /// is returned as is: a caller arriving just after a flight settled gets
    /// that flight's pair or failure instead of spending the refresh token
    /// a second time.
    pub async fn refresh_rejected(
        &self,
        rejected_access_token: Option<&str>,
    ) -> Result<TokenPair, RefreshFailure> {
        self.join_or_start(rejected_access_token).await
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    // Check and set under one lock acquisition; nothing here awaits.
    fn join_or_start(&self, rejected: Option<&str>) -> Flight {
        let mut state = lock(&self.state);
        if let Some(ref flight) = state.pending {
            debug!(flight = state.last_flight, "Joining in-flight token refresh");
            return flight.clone();
        }
        if let (Some(rejected), Some(settled)) = (rejected, state.settled.as_ref()) {
            if settled.replaced.as_deref() == Some(rejected) {
                debug!("Rejected token already exchanged, reusing outcome");
                return future::ready(settled.outcome.clone()).boxed().shared();
            }
        }

        state.last_flight += 1;
        let id = state.last_flight;
        let Credential {
            access_token,
            refresh_token,
        } = self.store.read();
        let exchange = Arc::clone(&self.exchange);
        let shared_state = Arc::clone(&self.state);
        info!(flight = id, "Starting token refresh");

        let task = tokio::spawn(async move {
            let result = match refresh_token {
                Some(token) => exchange.exchange(token, access_token.clone()).await,
                None => Err(RefreshError::MissingRefreshToken),
            };
            let outcome = match result {
                Ok(pair) => {
                    info!(flight = id, "Token refresh succeeded");
                    Ok(pair)
                }
                Err(reason) => {
                    warn!(flight = id, error = %reason, "Token refresh failed");
                    Err(RefreshFailure { flight: id, reason })
                }
            };

            // Reset before any waiter sees the outcome, so a caller failing
            // right after this starts a fresh exchange.
            let mut state = lock(&shared_state);
            state.pending = None;
            state.settled = Some(Settled {
                replaced: access_token,
                outcome: outcome.clone(),
            });
            outcome
        });

        let waiter_state = Arc::clone(&self.state);
        let flight = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(flight = id, error = %e, "Token refresh task aborted");
                    let mut state = lock(&waiter_state);
                    if state.last_flight == id {
                        state.pending = None;
                    }
                    Err(RefreshFailure {
                        flight: id,
                        reason: RefreshError::Interrupted(e.to_string()),
                    })
                }
            }
        }
        .boxed()
        .shared();

        state.pending = Some(flight.clone());
        flight
    }
}

fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
