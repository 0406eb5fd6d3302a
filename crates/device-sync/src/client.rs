//! API client for the sync service.
//!
//! Stateless over HTTPS apart from the token bundle it keeps in the secret
//! store. On a 401 the client exchanges the refresh token exactly once per
//! failure and retries; the rotated pair is persisted as one atomic value.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::sync::Mutex;

use mailhaven_core::secrets::SecretStore;
use mailhaven_core::sync::SyncDataType;

use crate::error::{DeviceSyncError, Result};
use crate::types::*;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Secret store key holding the serialized [`TokenBundle`]. One key so the
/// access/refresh pair rotates atomically.
const SYNC_TOKENS_KEY: &str = "sync_tokens";

/// Client for the mailhaven sync service.
#[derive(Clone)]
pub struct SyncApiClient {
    client: reqwest::Client,
    base_url: String,
    secrets: Arc<dyn SecretStore>,
    refresh_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SyncApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SyncApiClient {
    pub fn new(base_url: &str, secrets: Arc<dyn SecretStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secrets,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    fn headers(&self, token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| DeviceSyncError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }
        Ok(headers)
    }

    /// Parse an envelope response, mapping error envelopes and carrying the
    /// Retry-After floor through on 429s.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(envelope) = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body) {
                return Err(DeviceSyncError::Api {
                    status: status.as_u16(),
                    code: envelope.code.unwrap_or_else(|| "UNKNOWN".to_string()),
                    message: envelope.message.unwrap_or_default(),
                    retry_after,
                });
            }
            return Err(DeviceSyncError::Api {
                status: status.as_u16(),
                code: "UNKNOWN".to_string(),
                message: format!("Request failed: {}", body),
                retry_after,
            });
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body).map_err(|e| {
            log::error!("Failed to deserialize response. Body: {}, Error: {}", body, e);
            DeviceSyncError::api(
                status.as_u16(),
                "PARSE_ERROR",
                format!("Failed to parse response: {}", e),
            )
        })?;
        envelope.data.ok_or_else(|| {
            DeviceSyncError::api(status.as_u16(), "PARSE_ERROR", "Response envelope has no data")
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Token management
    // ─────────────────────────────────────────────────────────────────────

    pub fn stored_tokens(&self) -> Result<Option<TokenBundle>> {
        let raw = self.secrets.get_secret(SYNC_TOKENS_KEY)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn store_tokens(&self, tokens: &TokenBundle) -> Result<()> {
        let json = serde_json::to_string(tokens)?;
        self.secrets.set_secret(SYNC_TOKENS_KEY, &json)?;
        Ok(())
    }

    pub fn clear_tokens(&self) -> Result<()> {
        self.secrets.delete_secret(SYNC_TOKENS_KEY)?;
        Ok(())
    }

    fn access_token(&self) -> Result<String> {
        self.stored_tokens()?
            .map(|t| t.access_token)
            .ok_or_else(|| DeviceSyncError::auth("Not signed in"))
    }

    /// Exchange the refresh token for a new pair and persist it atomically.
    ///
    /// The lock prevents concurrent refresh storms; the second waiter finds
    /// the rotated pair already stored and returns it without a network call.
    async fn refresh_access_token(&self, stale_access_token: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        let current = self
            .stored_tokens()?
            .ok_or_else(|| DeviceSyncError::auth("Not signed in"))?;
        if current.access_token != stale_access_token {
            // Someone else already rotated while we waited on the lock.
            return Ok(current.access_token);
        }

        let url = format!("{}/auth/refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(None)?)
            .json(&RefreshRequest {
                refresh_token: current.refresh_token,
            })
            .send()
            .await?;

        let refreshed: RefreshResponse = match Self::parse_response(response).await {
            Ok(value) => value,
            Err(err) if err.status_code() == Some(401) => {
                // Refresh token revoked or reused: re-login required.
                return Err(DeviceSyncError::auth("Session expired; sign in again"));
            }
            Err(err) => return Err(err),
        };

        self.store_tokens(&refreshed.tokens)?;
        debug!("[DeviceSync] Access token refreshed and rotated");
        Ok(refreshed.tokens.access_token)
    }

    /// Send an authenticated request; on 401, refresh once and retry once.
    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.access_token()?;
        let response = build(&self.client, &token)
            .headers(self.headers(Some(&token))?)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let fresh = self.refresh_access_token(&token).await?;
        let retried = build(&self.client, &fresh)
            .headers(self.headers(Some(&fresh))?)
            .send()
            .await?;
        Ok(retried)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Auth
    // ─────────────────────────────────────────────────────────────────────

    /// POST /auth/register
    pub async fn register(&self, request: RegisterRequest) -> Result<AuthSession> {
        let url = format!("{}/auth/register", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(None)?)
            .json(&request)
            .send()
            .await?;
        let session: AuthSession = Self::parse_response(response).await?;
        self.store_tokens(&session.tokens)?;
        Ok(session)
    }

    /// POST /auth/params. Salt fetch for local auth-hash derivation.
    pub async fn auth_params(&self, email: &str) -> Result<AuthParamsResponse> {
        let url = format!("{}/auth/params", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(None)?)
            .json(&AuthParamsRequest {
                email: email.to_string(),
            })
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// POST /auth/login
    pub async fn login(&self, request: LoginRequest) -> Result<AuthSession> {
        let url = format!("{}/auth/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(None)?)
            .json(&request)
            .send()
            .await?;
        let session: AuthSession = Self::parse_response(response).await?;
        self.store_tokens(&session.tokens)?;
        Ok(session)
    }

    /// POST /auth/logout. Revokes the refresh token server-side, then drops
    /// the local bundle either way.
    pub async fn logout(&self) -> Result<()> {
        let url = format!("{}/auth/logout", self.base_url);
        let result = match self.send_authorized(|client, _| client.post(&url)).await {
            Ok(response) => Self::parse_response::<SuccessResponse>(response)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        self.clear_tokens()?;
        result
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delta sync
    // ─────────────────────────────────────────────────────────────────────

    /// POST /sync/{data_type}/delta
    pub async fn push_delta(
        &self,
        data_type: SyncDataType,
        request: &PushDeltaRequest,
    ) -> Result<PushDeltaResponse> {
        let url = format!("{}/sync/{}/delta", self.base_url, data_type.as_str());
        let response = self
            .send_authorized(|client, _| client.post(&url).json(request))
            .await?;
        Self::parse_response(response).await
    }

    /// GET /sync/{data_type}/delta?since&limit&offset
    pub async fn pull_delta(
        &self,
        data_type: SyncDataType,
        since: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<PullDeltaResponse> {
        let url = format!("{}/sync/{}/delta", self.base_url, data_type.as_str());
        let mut query: Vec<(&str, String)> = vec![
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let response = self
            .send_authorized(|client, _| client.get(&url).query(&query))
            .await?;
        Self::parse_response(response).await
    }

    /// GET /sync/{data_type}/deleted?since&limit&offset
    pub async fn pull_deleted(
        &self,
        data_type: SyncDataType,
        since: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<DeletedResponse> {
        let url = format!("{}/sync/{}/deleted", self.base_url, data_type.as_str());
        let mut query: Vec<(&str, String)> = vec![
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let response = self
            .send_authorized(|client, _| client.get(&url).query(&query))
            .await?;
        Self::parse_response(response).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────

    /// GET /devices
    pub async fn list_devices(&self) -> Result<DevicesResponse> {
        let url = format!("{}/devices", self.base_url);
        let response = self.send_authorized(|client, _| client.get(&url)).await?;
        Self::parse_response(response).await
    }

    /// DELETE /devices/{device_id}
    pub async fn delete_device(&self, device_id: &str) -> Result<SuccessResponse> {
        let url = format!("{}/devices/{}", self.base_url, device_id);
        let response = self
            .send_authorized(|client, _| client.delete(&url))
            .await?;
        Self::parse_response(response).await
    }
}
