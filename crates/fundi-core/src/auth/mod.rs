//! Token lifecycle management for the Fundi backend.
//!
//! The token manager owns the access/refresh pair, decides when a token is
//! stale, and serializes concurrent refresh attempts into a single in-flight
//! refresh so simultaneous screen fetches never race independent refreshes.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::normalize_base_url;
use crate::error::{ApiError, ApiResult};
use crate::util::unix_timestamp_now;

const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Access/refresh token pair with Unix-second expiries.
///
/// Serialized as one blob so persistence is all-or-nothing; a partial write
/// could pair a new access token with a stale expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

impl TokenPair {
    /// Whether the access token is stale, with a skew allowance so a token
    /// about to lapse mid-request is treated as already expired.
    pub fn access_expired(&self, now: i64) -> bool {
        self.access_expires_at <= now + EXPIRY_SKEW_SECONDS
    }

    /// Whether the refresh token itself has lapsed.
    pub fn refresh_expired(&self, now: i64) -> bool {
        self.refresh_expires_at <= now
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Session validity derived from the stored pair; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Access token present and unexpired.
    Valid,
    /// Access token stale but the refresh token is still usable.
    Refreshable,
    /// No usable tokens; the user must sign in again.
    Expired,
}

impl SessionState {
    fn derive(pair: Option<&TokenPair>, now: i64) -> Self {
        match pair {
            Some(pair) if !pair.access_expired(now) => Self::Valid,
            Some(pair) if !pair.refresh_expired(now) => Self::Refreshable,
            _ => Self::Expired,
        }
    }
}

/// Device-local persistence for the token pair.
///
/// `save` always receives the whole pair; implementations must write it as a
/// single unit so a concurrent reader never observes interleaved fields.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> ApiResult<Option<TokenPair>>;
    fn save(&self, pair: &TokenPair) -> ApiResult<()>;
    fn clear(&self) -> ApiResult<()>;
}

/// In-memory token store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: StdMutex<Option<String>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> ApiResult<Option<TokenPair>> {
        let guard = self
            .slot
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        match guard.as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, pair: &TokenPair) -> ApiResult<()> {
        let raw = serde_json::to_string(pair)?;
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        *guard = Some(raw);
        Ok(())
    }

    fn clear(&self) -> ApiResult<()> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// Refresh endpoint abstraction so the manager can be exercised without a
/// live backend.
#[async_trait]
pub trait RefreshApi: Send + Sync {
    /// Exchanges a refresh token for a new pair. A failure here is terminal
    /// for the session; the caller never retries this endpoint.
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair>;
}

/// HTTP client for the backend auth routes.
#[derive(Debug, Clone)]
pub struct AuthClient {
    base_url: String,
    client: reqwest::Client,
}

impl AuthClient {
    pub fn new(base_url: impl AsRef<str>) -> ApiResult<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.as_ref())?,
            client: reqwest::Client::builder().build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Signs in with email/password and returns the issued pair.
    pub async fn sign_in(&self, email: &str, password: &str) -> ApiResult<TokenPair> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ApiError::Api("Email and password are required".to_string()));
        }
        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });
        self.post_token_request("/v1/auth/login", &payload).await
    }

    async fn post_token_request(
        &self,
        route: &str,
        payload: &serde_json::Value,
    ) -> ApiResult<TokenPair> {
        let response = self
            .client
            .post(format!("{}{route}", self.base_url))
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            if status.is_server_error() {
                return Err(ApiError::Server {
                    status: status.as_u16(),
                    message: parse_api_error(status, &body),
                });
            }
            return Err(ApiError::Api(parse_api_error(status, &body)));
        }

        let envelope = serde_json::from_str::<AuthEnvelope>(&body)?;
        envelope.into_token_pair()
    }
}

#[async_trait]
impl RefreshApi for AuthClient {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        if refresh_token.trim().is_empty() {
            return Err(ApiError::SessionExpired);
        }
        let payload = serde_json::json!({
            "refresh_token": refresh_token,
        });
        self.post_token_request("/v1/auth/refresh", &payload).await
    }
}

/// Owns the token pair and the single-flight refresh gate.
///
/// The pair is reachable only through these methods; shells never touch the
/// underlying storage directly.
pub struct TokenManager {
    refresh_api: Arc<dyn RefreshApi>,
    store: Arc<dyn TokenStore>,
    pair: StdMutex<Option<TokenPair>>,
    refresh_gate: Mutex<()>,
}

impl TokenManager {
    pub fn new(refresh_api: Arc<dyn RefreshApi>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            refresh_api,
            store,
            pair: StdMutex::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Loads the persisted pair into memory and reports the derived state.
    pub fn restore(&self) -> ApiResult<SessionState> {
        let loaded = self.store.load()?;
        let mut guard = self.lock_pair()?;
        *guard = loaded;
        Ok(SessionState::derive(guard.as_ref(), unix_timestamp_now()))
    }

    /// Derived validity of the in-memory pair.
    pub fn session_state(&self) -> SessionState {
        self.lock_pair().map_or(SessionState::Expired, |guard| {
            SessionState::derive(guard.as_ref(), unix_timestamp_now())
        })
    }

    /// Returns the current access token, refreshing it first when stale.
    ///
    /// Callers arriving while a refresh is in flight await that same refresh
    /// instead of starting another; exactly one refresh-endpoint call is made
    /// no matter how many screens fetch simultaneously.
    pub async fn get_valid_token(&self) -> ApiResult<String> {
        if let Some(token) = self.unexpired_access_token()? {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have completed the refresh while we waited.
        if let Some(token) = self.unexpired_access_token()? {
            return Ok(token);
        }
        self.refresh_holding_gate().await
    }

    /// Unconditionally refreshes after a 401 the expiry check did not predict
    /// (server-side revocation, clock skew).
    ///
    /// `stale_access` is the token that was rejected. If the stored token no
    /// longer matches it, a concurrent caller already refreshed and the
    /// current token is returned without touching the endpoint again.
    pub async fn force_refresh(&self, stale_access: &str) -> ApiResult<String> {
        let _gate = self.refresh_gate.lock().await;
        {
            let guard = self.lock_pair()?;
            if let Some(pair) = guard.as_ref() {
                if pair.access_token != stale_access
                    && !pair.access_expired(unix_timestamp_now())
                {
                    return Ok(pair.access_token.clone());
                }
            }
        }
        self.refresh_holding_gate().await
    }

    /// Persists a freshly issued pair (after sign-in) as a single unit and
    /// updates the in-memory copy.
    pub fn store_token_pair(&self, pair: TokenPair) -> ApiResult<()> {
        self.store.save(&pair)?;
        let mut guard = self.lock_pair()?;
        *guard = Some(pair);
        Ok(())
    }

    /// Drops the pair from memory and storage.
    pub fn sign_out(&self) -> ApiResult<()> {
        self.store.clear()?;
        let mut guard = self.lock_pair()?;
        *guard = None;
        Ok(())
    }

    fn unexpired_access_token(&self) -> ApiResult<Option<String>> {
        let guard = self.lock_pair()?;
        Ok(guard
            .as_ref()
            .filter(|pair| !pair.access_expired(unix_timestamp_now()))
            .map(|pair| pair.access_token.clone()))
    }

    /// Performs the refresh. Caller must hold `refresh_gate`.
    ///
    /// Endpoint failure (network or non-2xx) is terminal: the stored pair is
    /// cleared and the session is reported expired. The refresh endpoint is
    /// never retried here.
    async fn refresh_holding_gate(&self) -> ApiResult<String> {
        let refresh_token = {
            let guard = self.lock_pair()?;
            match guard.as_ref() {
                Some(pair) if !pair.refresh_expired(unix_timestamp_now()) => {
                    pair.refresh_token.clone()
                }
                _ => {
                    drop(guard);
                    self.clear_expired()?;
                    return Err(ApiError::SessionExpired);
                }
            }
        };

        match self.refresh_api.refresh(&refresh_token).await {
            Ok(pair) => {
                let access_token = pair.access_token.clone();
                self.store.save(&pair)?;
                let mut guard = self.lock_pair()?;
                *guard = Some(pair);
                Ok(access_token)
            }
            Err(error) => {
                tracing::warn!("Token refresh failed, clearing session: {error}");
                self.clear_expired()?;
                Err(ApiError::SessionExpired)
            }
        }
    }

    fn clear_expired(&self) -> ApiResult<()> {
        self.store.clear()?;
        let mut guard = self.lock_pair()?;
        *guard = None;
        Ok(())
    }

    fn lock_pair(&self) -> ApiResult<std::sync::MutexGuard<'_, Option<TokenPair>>> {
        self.pair
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokenManager")
            .field("session_state", &self.session_state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    status: Option<String>,
    data: Option<TokenPayload>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    access_expires_at: Option<i64>,
    access_expires_in: Option<i64>,
    refresh_expires_at: Option<i64>,
    refresh_expires_in: Option<i64>,
}

impl AuthEnvelope {
    fn into_token_pair(self) -> ApiResult<TokenPair> {
        if self.status.as_deref() != Some("success") {
            return Err(ApiError::Api(
                self.message
                    .unwrap_or_else(|| "Auth response reported failure".to_string()),
            ));
        }
        let payload = self
            .data
            .ok_or_else(|| ApiError::Api("Auth response did not include data".to_string()))?;

        let now = unix_timestamp_now();
        let access_expires_at = payload
            .access_expires_at
            .or_else(|| payload.access_expires_in.map(|ttl| now.saturating_add(ttl)));
        let refresh_expires_at = payload
            .refresh_expires_at
            .or_else(|| payload.refresh_expires_in.map(|ttl| now.saturating_add(ttl)));

        match (
            payload.access_token,
            payload.refresh_token,
            access_expires_at,
            refresh_expires_at,
        ) {
            (Some(access_token), Some(refresh_token), Some(access_exp), Some(refresh_exp)) => {
                Ok(TokenPair {
                    access_token,
                    refresh_token,
                    access_expires_at: access_exp,
                    refresh_expires_at: refresh_exp,
                })
            }
            _ => Err(ApiError::Api(
                "Auth response did not include enough token fields".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<AuthErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", crate::util::compact_text(trimmed), status.as_u16())
    }
}
