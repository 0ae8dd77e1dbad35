//! Typed wrappers for the backend REST endpoints.
//!
//! All of them go through `ApiClient::send`, so they get bearer injection and
//! session recovery for free. The credential endpoints opt out of refresh:
//! a 401 there means bad input, not an expired session.

use tracing::{info, warn};

use super::client::ApiClient;
use super::error::ApiError;
use super::transport::ApiRequest;
use crate::models::{
    CleanRequest, LoginRequest, RegisteredUser, SessionInfo, SessionRename, TokenPair, UserInfo,
};

impl ApiClient {
    // ===== Auth =====

    /// Log in and store the issued pair
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair, ApiError> {
        let request = ApiRequest::post("auth/login")
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })?
            .without_refresh();

        let pair: TokenPair = self.fetch(request).await?;
        self.store().store_pair(&pair)?;
        info!(username = username, "Logged in");
        Ok(pair)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<RegisteredUser, ApiError> {
        let request = ApiRequest::post("auth/register")
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })?
            .without_refresh();
        self.fetch(request).await
    }

    /// Tell the server, then forget the pair locally even if the call failed
    pub async fn logout(&self) -> Result<(), ApiError> {
        if let Err(e) = self
            .execute(ApiRequest::post("auth/logout").without_refresh())
            .await
        {
            warn!(error = %e, "Logout request failed, clearing credentials anyway");
        }
        self.store().clear()?;
        info!("Logged out");
        Ok(())
    }

    // ===== Account =====

    pub async fn get_info(&self) -> Result<UserInfo, ApiError> {
        self.fetch(ApiRequest::get("account/get_info")).await
    }

    // ===== Analysis sessions =====

    pub async fn get_sessions(&self) -> Result<Vec<SessionInfo>, ApiError> {
        self.fetch(ApiRequest::get("session/get_sessions")).await
    }

    pub async fn add_session(&self, session: &SessionInfo) -> Result<(), ApiError> {
        self.execute(ApiRequest::post("session/add_session").json(session)?)
            .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::delete(format!(
            "session/delete_session/{}",
            session_id
        )))
        .await
    }

    pub async fn update_session_name(&self, session_id: &str, name: &str) -> Result<(), ApiError> {
        let request = ApiRequest::put(format!("session/update_session_name/{}", session_id))
            .json(&SessionRename { name })?;
        self.execute(request).await
    }

    // ===== Files =====

    pub async fn upload_file(
        &self,
        session_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ApiError> {
        let request = ApiRequest::post("file/upload")
            .query("session_id", session_id)
            .file("file", file_name, bytes);
        self.execute(request).await
    }

    /// Raw file contents for the session
    pub async fn download_file(&self, session_id: &str) -> Result<Vec<u8>, ApiError> {
        let request = ApiRequest::get("file/download").query("session_id", session_id);
        Ok(self.send(request).await?.body)
    }

    pub async fn preview_file(&self, session_id: &str) -> Result<serde_json::Value, ApiError> {
        let request = ApiRequest::get("file/preview").query("session_id", session_id);
        self.fetch(request).await
    }

    pub async fn clean_file(&self, session_id: &str, clean_strategy: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post("file/clean").json(&CleanRequest {
            session_id,
            clean_strategy,
        })?;
        self.execute(request).await
    }

    // ===== Analysis =====

    pub async fn analyze_predict(
        &self,
        session_id: &str,
        algorithm: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let request = ApiRequest::get("analyze/predict")
            .query("session_id", session_id)
            .query("algorithm", algorithm);
        self.fetch(request).await
    }
}
