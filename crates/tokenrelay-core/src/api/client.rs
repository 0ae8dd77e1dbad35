//! Authenticated request pipeline.
//!
//! Every call goes through two stages. Outbound, the current access token is
//! attached as a bearer header. Inbound, a 401 triggers one shared token
//! refresh followed by a single replay of the original request; a failed
//! refresh ends the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::error::{ApiError, TransportError};
use super::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use crate::auth::{
    CredentialStore, HttpRefreshExchange, RefreshCoordinator, RefreshExchange, RefreshFailure,
};
use crate::config::ClientConfig;
use crate::router::{Location, Navigator};

/// Shown to the user when a session cannot be recovered
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired, please log in again";

/// Interrupt-style user notification.
pub trait Notifier: Send + Sync {
    fn session_expired(&self, message: &str);
}

/// `Notifier` that only logs.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn session_expired(&self, message: &str) {
        error!("{}", message);
    }
}

/// API client wrapping every call in the authenticated pipeline.
/// Clone is cheap - all state is shared behind `Arc`s.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    /// Highest refresh flight whose failure already ended the session
    expired_flight: Arc<AtomicU64>,
}

impl ApiClient {
    /// Create a client talking HTTP to `config.base_url`
    pub fn new(
        config: &ClientConfig,
        store: Arc<CredentialStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(&config.base_url, config.timeout_secs)?;
        Ok(Self::with_transport(Arc::new(transport), store, navigator))
    }

    /// Create a client over any transport; refreshes go over the same transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let exchange = Arc::new(HttpRefreshExchange::new(Arc::clone(&transport)));
        Self {
            refresher: Arc::new(RefreshCoordinator::new(Arc::clone(&store), exchange)),
            transport,
            store,
            navigator,
            notifier: Arc::new(LogNotifier),
            expired_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_refresh_exchange(mut self, exchange: Arc<dyn RefreshExchange>) -> Self {
        self.refresher = Arc::new(RefreshCoordinator::new(Arc::clone(&self.store), exchange));
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Send a request through the pipeline.
    ///
    /// Returns 2xx responses unchanged. Non-401 failures are forwarded as
    /// they are; a 401 is recovered at most once.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let access_token = self.store.access_token();
        let response = self.dispatch(&request, access_token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED || !request.refreshable {
            return Self::check_response(response);
        }

        debug!(method = %request.method, path = %request.path, "Access token rejected, refreshing");
        match self.refresher.refresh_rejected(access_token.as_deref()).await {
            Ok(pair) => {
                // The retry below uses the exchanged token whether or not it persisted
                if let Err(e) = self.store.store_pair(&pair) {
                    warn!(error = %e, "Refreshed credentials not persisted");
                }
                let retry = self.dispatch(&request, Some(&pair.access_token)).await?;
                if retry.status() == StatusCode::UNAUTHORIZED {
                    warn!(path = %request.path, "Request rejected again after refresh");
                }
                Self::check_response(retry)
            }
            Err(failure) => {
                self.end_session(&failure);
                Err(ApiError::SessionExpired(failure))
            }
        }
    }

    /// Send and decode the envelope's `data`
    pub async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        self.send(request)
            .await?
            .envelope::<T>()?
            .data
            .ok_or_else(|| ApiError::InvalidResponse(format!("Missing data in response from {}", path)))
    }

    /// Send a call whose reply carries no data.
    ///
    /// An enveloped reply still has its code checked; a bare acknowledgement
    /// body is accepted as is.
    pub async fn execute(&self, request: ApiRequest) -> Result<(), ApiError> {
        let response = self.send(request).await?;
        match response.envelope::<serde_json::Value>() {
            Ok(_) | Err(ApiError::InvalidResponse(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.transport
            .send(request.clone().bearer(access_token))
            .await
    }

    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status(), &response.text()))
        }
    }

    /// Clear credentials, notify and route to login - once per failed flight,
    /// however many callers joined it.
    fn end_session(&self, failure: &RefreshFailure) {
        let previous = self.expired_flight.fetch_max(failure.flight, Ordering::SeqCst);
        if previous >= failure.flight {
            debug!(flight = failure.flight, "Session already ended for this refresh");
            return;
        }

        info!(flight = failure.flight, reason = %failure.reason, "Session could not be recovered");
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear persisted credentials");
        }
        self.notifier.session_expired(SESSION_EXPIRED_MESSAGE);
        self.navigator.navigate(Location::login());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use futures::future::{join_all, BoxFuture};
    use futures::FutureExt;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::api::transport::RequestBody;
    use crate::auth::{Credential, RefreshError, REFRESH_PATH};
    use crate::models::TokenPair;
    use crate::router::ChannelNavigator;

    /// Scripted backend: accepts exactly one access token, rotates it on refresh.
    pub(crate) struct FakeBackend {
        pub valid_token: Mutex<String>,
        pub refresh_reply: Mutex<(u16, String)>,
        pub reject_everything: Mutex<bool>,
        /// Fixed replies by path, served without checking the token
        pub replies: Mutex<HashMap<String, (u16, String)>>,
        pub requests: Mutex<Vec<ApiRequest>>,
        pub refresh_calls: AtomicUsize,
        pub rejected: AtomicUsize,
        pub gate: Option<Semaphore>,
    }

    impl FakeBackend {
        pub fn new(valid_token: &str) -> Self {
            Self {
                valid_token: Mutex::new(valid_token.to_string()),
                refresh_reply: Mutex::new(refresh_ok("X2", "R2")),
                reject_everything: Mutex::new(false),
                replies: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                refresh_calls: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
                gate: None,
            }
        }

        /// Hold every refresh until `release()` is called
        pub fn gated(mut self) -> Self {
            self.gate = Some(Semaphore::new(0));
            self
        }

        pub fn reply(self, path: &str, status: u16, body: impl Into<String>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(path.to_string(), (status, body.into()));
            self
        }

        pub fn release(&self) {
            if let Some(ref gate) = self.gate {
                gate.add_permits(1);
            }
        }

        pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.path == path)
                .cloned()
                .collect()
        }

        async fn handle(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());

            match request.path.as_str() {
                "offline" => return Err(TransportError::Connect("connection refused".to_string())),
                "boom" => return Ok(ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "oops")),
                "business" => {
                    return Ok(ApiResponse::new(
                        StatusCode::OK,
                        r#"{"code":40001,"message":"bad session","data":null}"#,
                    ))
                }
                _ => {}
            }

            let scripted = self.replies.lock().unwrap().get(&request.path).cloned();
            if let Some((status, body)) = scripted {
                return Ok(ApiResponse::new(StatusCode::from_u16(status).unwrap(), body));
            }

            if request.path == REFRESH_PATH {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(ref gate) = self.gate {
                    gate.acquire().await.expect("gate closed").forget();
                }
                let (status, body) = self.refresh_reply.lock().unwrap().clone();
                if status == 200 {
                    let parsed: crate::models::Envelope<TokenPair> =
                        serde_json::from_str(&body).unwrap();
                    if let Some(pair) = parsed.data {
                        *self.valid_token.lock().unwrap() = pair.access_token;
                    }
                }
                let status = StatusCode::from_u16(status).unwrap();
                return Ok(ApiResponse::new(status, body));
            }

            let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
            let rejected = *self.reject_everything.lock().unwrap()
                || request.authorization.as_deref() != Some(expected.as_str());
            if rejected {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                return Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "token expired"));
            }

            let body = serde_json::json!({ "code": 200, "message": "ok", "data": request.path });
            Ok(ApiResponse::new(StatusCode::OK, body.to_string()))
        }
    }

    pub(crate) fn refresh_ok(access: &str, refresh: &str) -> (u16, String) {
        let body = serde_json::json!({
            "code": 200,
            "message": "ok",
            "data": { "access_token": access, "refresh_token": refresh, "token_type": "bearer" }
        });
        (200, body.to_string())
    }

    impl Transport for Arc<FakeBackend> {
        fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, TransportError>> {
            self.handle(request).boxed()
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingNotifier {
        pub count: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn session_expired(&self, _message: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct Harness {
        pub backend: Arc<FakeBackend>,
        pub store: Arc<CredentialStore>,
        pub client: ApiClient,
        pub navigations: tokio::sync::mpsc::UnboundedReceiver<Location>,
        pub notifier: Arc<CountingNotifier>,
    }

    impl Harness {
        pub fn new(backend: FakeBackend, credential: Option<Credential>) -> Self {
            let backend = Arc::new(backend);
            let store = Arc::new(CredentialStore::in_memory());
            if let Some(credential) = credential {
                store.write(credential).unwrap();
            }
            let (navigator, navigations) = ChannelNavigator::new();
            let notifier = Arc::new(CountingNotifier::default());
            let client = ApiClient::with_transport(
                Arc::new(Arc::clone(&backend)),
                Arc::clone(&store),
                Arc::new(navigator),
            )
            .with_notifier(notifier.clone());
            Self {
                backend,
                store,
                client,
                navigations,
                notifier,
            }
        }

        pub fn drain_navigations(&mut self) -> Vec<Location> {
            let mut seen = Vec::new();
            while let Ok(location) = self.navigations.try_recv() {
                seen.push(location);
            }
            seen
        }
    }

    fn expired_session() -> Option<Credential> {
        Some(Credential::new("X1", "R1"))
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let harness = Harness::new(FakeBackend::new("X1"), expired_session());
        let response = harness.client.send(ApiRequest::get("a")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let sent = harness.backend.requests_to("a");
        assert_eq!(sent[0].authorization.as_deref(), Some("Bearer X1"));
        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_token_sends_marker() {
        let harness = Harness::new(FakeBackend::new("X1"), None);
        let _ = harness.client.send(ApiRequest::get("a").without_refresh()).await;

        let sent = harness.backend.requests_to("a");
        assert_eq!(sent[0].authorization.as_deref(), Some("Bearer null"));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let mut harness = Harness::new(FakeBackend::new("X2").gated(), expired_session());
        let client = harness.client.clone();
        let backend = Arc::clone(&harness.backend);

        let calls = join_all(["a", "b"].map(|path| client.send(ApiRequest::get(path))));
        let release = async {
            while backend.rejected.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
            backend.release();
        };
        let (results, ()) = tokio::join!(calls, release);

        for (result, path) in results.into_iter().zip(["a", "b"]) {
            let response = result.unwrap();
            let data: String = response.envelope().unwrap().data.unwrap();
            assert_eq!(data, path);
        }

        assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
        for path in ["a", "b"] {
            let sent = backend.requests_to(path);
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0].authorization.as_deref(), Some("Bearer X1"));
            assert_eq!(sent[1].authorization.as_deref(), Some("Bearer X2"));
        }
        assert_eq!(harness.store.read(), Credential::new("X2", "R2"));
        assert!(harness.drain_navigations().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_sends_current_refresh_token() {
        let harness = Harness::new(FakeBackend::new("X2"), expired_session());
        harness.client.send(ApiRequest::get("a")).await.unwrap();

        let refreshes = harness.backend.requests_to(REFRESH_PATH);
        assert_eq!(refreshes.len(), 1);
        assert_eq!(
            refreshes[0].body,
            RequestBody::Json(serde_json::json!({ "refresh_token": "R1" }))
        );
        assert_eq!(refreshes[0].authorization.as_deref(), Some("Bearer X1"));
    }

    #[tokio::test]
    async fn test_retry_happens_once() {
        let mut harness = Harness::new(FakeBackend::new("X2"), expired_session());
        *harness.backend.reject_everything.lock().unwrap() = true;

        let result = harness.client.send(ApiRequest::get("a")).await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.backend.requests_to("a").len(), 2);
        // Refresh itself succeeded, so the session stays
        assert_eq!(harness.store.read(), Credential::new("X2", "R2"));
        assert!(harness.drain_navigations().is_empty());
    }

    #[tokio::test]
    async fn test_retry_replays_same_body() {
        let harness = Harness::new(FakeBackend::new("X2"), expired_session());
        let request = ApiRequest::post("session/add_session")
            .json(&serde_json::json!({ "session_id": "s1", "name": "Q3" }))
            .unwrap()
            .query("trace", "1");

        harness.client.send(request.clone()).await.unwrap();

        let sent = harness.backend.requests_to("session/add_session");
        assert_eq!(sent.len(), 2);
        for attempt in sent {
            assert_eq!(attempt.body, request.body);
            assert_eq!(attempt.query, request.query);
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_ends_session_once() {
        let mut harness = Harness::new(FakeBackend::new("X2").gated(), expired_session());
        *harness.backend.refresh_reply.lock().unwrap() =
            (200, r#"{"code":401,"message":"refresh token expired","data":null}"#.to_string());
        let client = harness.client.clone();
        let backend = Arc::clone(&harness.backend);

        let calls = join_all(["a", "b", "c"].map(|path| client.send(ApiRequest::get(path))));
        let release = async {
            while backend.rejected.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
            backend.release();
        };
        let (results, ()) = tokio::join!(calls, release);

        for result in results {
            match result {
                Err(ApiError::SessionExpired(failure)) => assert!(matches!(
                    failure.reason,
                    RefreshError::Rejected { code: 401, .. }
                )),
                other => panic!("expected session expiry, got {:?}", other),
            }
        }
        assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.store.read(), Credential::default());
        assert_eq!(harness.drain_navigations(), vec![Location::login()]);
        assert_eq!(harness.notifier.count.load(Ordering::SeqCst), 1);
    }

    type RequestTask = tokio::task::JoinHandle<Result<ApiResponse, ApiError>>;

    fn spawn_requests(client: &ApiClient, count: usize) -> Vec<RequestTask> {
        (0..count)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.send(ApiRequest::get(format!("p{}", i))).await })
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_refresh_ends_session_once_across_threads() {
        let mut harness = Harness::new(FakeBackend::new("X2").gated(), expired_session());
        *harness.backend.refresh_reply.lock().unwrap() = (401, "expired".to_string());

        let tasks = spawn_requests(&harness.client, 8);
        while harness.backend.rejected.load(Ordering::SeqCst) < 8 {
            tokio::task::yield_now().await;
        }
        harness.backend.release();

        for task in tasks {
            let result = task.await.expect("request task panicked");
            assert!(matches!(result, Err(ApiError::SessionExpired(ref f)) if f.flight == 1));
        }
        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.notifier.count.load(Ordering::SeqCst), 1);
        assert_eq!(harness.drain_navigations(), vec![Location::login()]);
        assert!(!harness.store.is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_share_one_refresh_across_threads() {
        let mut harness = Harness::new(FakeBackend::new("X2").gated(), expired_session());

        let tasks = spawn_requests(&harness.client, 8);
        while harness.backend.rejected.load(Ordering::SeqCst) < 8 {
            tokio::task::yield_now().await;
        }
        harness.backend.release();

        for task in tasks {
            let response = task.await.expect("request task panicked").unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.store.read(), Credential::new("X2", "R2"));
        assert!(harness.drain_navigations().is_empty());
    }

    #[tokio::test]
    async fn test_new_failure_after_expiry_starts_fresh_refresh() {
        let mut harness = Harness::new(FakeBackend::new("X2"), expired_session());
        *harness.backend.refresh_reply.lock().unwrap() = (401, "expired".to_string());

        let first = harness.client.send(ApiRequest::get("a")).await;
        assert!(matches!(first, Err(ApiError::SessionExpired(_))));

        // User logs in again with a pair the server will also reject
        harness.store.write(Credential::new("X9", "R9")).unwrap();
        *harness.backend.refresh_reply.lock().unwrap() = refresh_ok("X2", "R2");

        let second = harness.client.send(ApiRequest::get("b")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.drain_navigations(), vec![Location::login()]);
    }

    #[tokio::test]
    async fn test_refresh_transport_error_is_session_expiry() {
        struct OfflineExchange;
        impl RefreshExchange for OfflineExchange {
            fn exchange(
                &self,
                _token: String,
                _access_token: Option<String>,
            ) -> BoxFuture<'static, Result<TokenPair, RefreshError>> {
                async { Err(RefreshError::Transport(TransportError::Timeout { timeout_secs: 10 })) }
                    .boxed()
            }
        }

        let mut harness = Harness::new(FakeBackend::new("X2"), expired_session());
        harness.client = harness
            .client
            .clone()
            .with_refresh_exchange(Arc::new(OfflineExchange));

        let result = harness.client.send(ApiRequest::get("a")).await;
        assert!(matches!(
            result,
            Err(ApiError::SessionExpired(RefreshFailure {
                reason: RefreshError::Transport(TransportError::Timeout { .. }),
                ..
            }))
        ));
        assert!(!harness.store.is_authenticated());
        assert_eq!(harness.drain_navigations().len(), 1);
    }

    #[tokio::test]
    async fn test_non_401_errors_pass_through() {
        let harness = Harness::new(FakeBackend::new("X1"), expired_session());

        let transport = harness.client.send(ApiRequest::get("offline")).await;
        assert!(matches!(
            transport,
            Err(ApiError::Transport(TransportError::Connect(_)))
        ));

        let server = harness.client.send(ApiRequest::get("boom")).await;
        assert!(matches!(server, Err(ApiError::ServerError(ref body)) if body == "oops"));

        let business = harness
            .client
            .fetch::<serde_json::Value>(ApiRequest::get("business"))
            .await;
        assert!(matches!(business, Err(ApiError::Business { code: 40001, .. })));

        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.store.read(), Credential::new("X1", "R1"));
    }

    #[tokio::test]
    async fn test_without_refresh_returns_unauthorized() {
        let harness = Harness::new(FakeBackend::new("X2"), expired_session());
        let result = harness.client.send(ApiRequest::get("a").without_refresh()).await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(harness.backend.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(harness.store.is_authenticated());
    }
}
