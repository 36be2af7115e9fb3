//! Platform client backed by an external gateway service.
//!
//! The gateway wraps the actual social-network client library and exposes
//! one JSON endpoint per operation. It is stateless: every request carries the
//! current session record, and responses may carry a refreshed one.
//!
//! Request: `POST <gateway_url>/<operation>` with `{"session": ..., "args": {...}}`.
//! Response: `{"ok": true, "data": ..., "session": ...}` or
//! `{"ok": false, "error": {"kind": ..., "message": ..., "two_factor_identifier": ...}}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::CoreError;
use crate::config::PlatformConfig;
use crate::platform::models::{Friendship, SessionRecord, UserId, UserProfile, UserShort};
use crate::platform::{ClientFactory, ClientHandle, PlatformClient, PlatformError, PlatformResult};

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    ok: bool,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    session: Option<SessionRecord>,
    #[serde(default)]
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    two_factor_identifier: Option<String>,
}

impl From<GatewayError> for PlatformError {
    fn from(e: GatewayError) -> Self {
        match e.kind.as_str() {
            "login_required" => Self::LoginRequired(e.message),
            "challenge_required" => Self::ChallengeRequired(e.message),
            "two_factor_required" => Self::TwoFactorRequired {
                identifier: e.two_factor_identifier.unwrap_or_default(),
            },
            "bad_credentials" | "bad_password" => Self::BadCredentials(e.message),
            "rate_limited" => Self::RateLimited(e.message),
            "not_found" => Self::NotFound(e.message),
            _ => Self::Other(format!("{}: {}", e.kind, e.message)),
        }
    }
}

/// Platform client that talks to the gateway over HTTP.
#[derive(Debug)]
pub struct GatewayClient {
    http_client: Client,
    base_url: String,
    session: Mutex<Option<SessionRecord>>,
}

impl GatewayClient {
    /// Create a client sharing an existing HTTP connection pool.
    #[must_use]
    pub fn with_http_client(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        }
    }

    /// Post one operation and return its `data` payload, refreshing the
    /// session from the response.
    async fn exchange(
        &self,
        operation: &str,
        args: serde_json::Value,
    ) -> PlatformResult<serde_json::Value> {
        let session = self.session.lock().clone();
        let url = format!("{}/{operation}", self.base_url);
        let body = json!({ "session": session, "args": args });

        log::debug!("gateway call: {operation}");

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Transport(format!("{operation} request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PlatformError::Transport(format!("reading {operation} response: {e}")))?;

        let envelope: GatewayResponse = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                PlatformError::Other(format!("parsing {operation} response: {e}"))
            } else {
                PlatformError::Other(format!("{operation} failed: {status} - {text}"))
            }
        })?;

        if let Some(refreshed) = envelope.session {
            *self.session.lock() = Some(refreshed);
        }

        if !envelope.ok {
            return Err(envelope.error.map_or_else(
                || PlatformError::Other(format!("{operation} failed: {status}")),
                PlatformError::from,
            ));
        }

        Ok(envelope.data)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: serde_json::Value,
    ) -> PlatformResult<T> {
        let data = self.exchange(operation, args).await?;
        serde_json::from_value(data)
            .map_err(|e| PlatformError::Other(format!("decoding {operation} data: {e}")))
    }

    /// Like [`Self::call`] for operations whose payload is not needed.
    /// Gateways pass through whatever the platform returned (a bool for a
    /// follow, the message for a send), so `data` is not decoded.
    async fn call_unit(&self, operation: &str, args: serde_json::Value) -> PlatformResult<()> {
        self.exchange(operation, args).await.map(drop)
    }
}

#[async_trait]
impl PlatformClient for GatewayClient {
    fn load_session(&self, record: &SessionRecord) {
        *self.session.lock() = Some(record.clone());
    }

    fn dump_session(&self) -> PlatformResult<SessionRecord> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| PlatformError::LoginRequired("no session to save".to_string()))
    }

    async fn login(&self, username: &str, password: &str) -> PlatformResult<()> {
        self.call_unit("login", json!({ "username": username, "password": password }))
            .await
    }

    async fn verify_session(&self) -> PlatformResult<()> {
        self.call_unit("verify_session", json!({})).await
    }

    async fn submit_challenge_code(&self, code: &str) -> PlatformResult<()> {
        self.call_unit("challenge", json!({ "code": code })).await
    }

    async fn login_two_factor(
        &self,
        username: &str,
        password: &str,
        identifier: &str,
        code: &str,
    ) -> PlatformResult<()> {
        self.call_unit(
            "two_factor_login",
            json!({
                "username": username,
                "password": password,
                "two_factor_identifier": identifier,
                "code": code,
            }),
        )
        .await
    }

    async fn user_id_from_username(&self, username: &str) -> PlatformResult<UserId> {
        self.call("user_id_from_username", json!({ "username": username }))
            .await
    }

    async fn user_followers(
        &self,
        user_id: &UserId,
        amount: u32,
    ) -> PlatformResult<Vec<UserShort>> {
        self.call(
            "user_followers",
            json!({ "user_id": user_id, "amount": amount }),
        )
        .await
    }

    async fn friendship(&self, user_id: &UserId) -> PlatformResult<Friendship> {
        self.call("friendship", json!({ "user_id": user_id })).await
    }

    async fn follow(&self, user_id: &UserId) -> PlatformResult<()> {
        self.call_unit("user_follow", json!({ "user_id": user_id })).await
    }

    async fn user_info_by_username(&self, username: &str) -> PlatformResult<UserProfile> {
        self.call("user_info_by_username", json!({ "username": username }))
            .await
    }

    async fn direct_send(&self, text: &str, recipients: &[UserId]) -> PlatformResult<()> {
        self.call_unit(
            "direct_send",
            json!({ "text": text, "user_ids": recipients }),
        )
        .await
    }
}

/// Builds [`GatewayClient`]s that share one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct GatewayClientFactory {
    http_client: Client,
    base_url: String,
}

impl GatewayClientFactory {
    /// Create a factory for the configured gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if HTTP client creation fails.
    pub fn new(config: &PlatformConfig) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| CoreError::Other(format!("creating HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: config.gateway_url.clone(),
        })
    }
}

impl ClientFactory for GatewayClientFactory {
    fn create(&self) -> ClientHandle {
        Arc::new(GatewayClient::with_http_client(
            self.http_client.clone(),
            &self.base_url,
        ))
    }
}
