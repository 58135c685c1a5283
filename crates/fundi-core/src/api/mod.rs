//! Authenticated request wrapper for the Fundi backend.
//!
//! Wraps every call with the shared token manager: attach a valid bearer
//! token, send, and classify the outcome. A 401 triggers one forced refresh
//! and one retry; a 429 triggers one retry after a fixed delay. Everything
//! else maps onto the [`ApiError`] taxonomy so screens never see raw HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::auth::TokenManager;
use crate::config::normalize_base_url;
use crate::error::{ApiError, ApiResult};
use crate::util::compact_text;

/// Fixed backoff before the single rate-limit retry.
pub const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A request as seen by the transport layer.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: String,
    pub body: Option<serde_json::Value>,
}

/// A raw response before classification.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Transport seam so the wrapper can be exercised with scripted responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> ApiResult<HttpResponse>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> ApiResult<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .bearer_auth(&request.bearer)
            .header("Accept", "application/json");
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpResponse { status, body })
    }
}

/// Response envelope used by every backend route.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: Option<String>,
    data: Option<T>,
    message: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> ApiResult<T> {
        if self.status.as_deref() != Some("success") {
            return Err(ApiError::Api(self.message.unwrap_or_else(|| {
                "Backend reported failure without a message".to_string()
            })));
        }
        self.data
            .ok_or_else(|| ApiError::Api("Response did not include data".to_string()))
    }
}

/// Authenticated HTTP client shared by all screens.
pub struct ApiClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    /// Builds a client with the production `reqwest` transport.
    pub fn new(base_url: impl AsRef<str>, tokens: Arc<TokenManager>) -> ApiResult<Self> {
        Self::with_transport(base_url, Arc::new(ReqwestTransport::new()?), tokens)
    }

    /// Builds a client over an explicit transport.
    pub fn with_transport(
        base_url: impl AsRef<str>,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
    ) -> ApiResult<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.as_ref())?,
            transport,
            tokens,
        })
    }

    /// The shared token manager backing this client.
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues an authenticated GET and decodes the envelope `data` field.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.execute(Method::GET, path, None).await
    }

    /// Issues an authenticated POST with a JSON body.
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> ApiResult<T> {
        self.execute(Method::POST, path, Some(body.clone())).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ApiResult<T> {
        let url = format!("{}{path}", self.base_url);
        let mut token = self.tokens.get_valid_token().await?;
        let mut refreshed_once = false;
        let mut retried_rate_limit = false;

        loop {
            let response = self
                .transport
                .send(HttpRequest {
                    method: method.clone(),
                    url: url.clone(),
                    bearer: token.clone(),
                    body: body.clone(),
                })
                .await?;

            match response.status {
                StatusCode::UNAUTHORIZED if !refreshed_once => {
                    // The expiry check did not predict this 401; refresh once
                    // and retry with the replacement token.
                    refreshed_once = true;
                    tracing::debug!("401 on {path}, forcing token refresh");
                    token = self.tokens.force_refresh(&token).await?;
                }
                StatusCode::UNAUTHORIZED => {
                    tracing::warn!("401 persisted after refresh on {path}");
                    return Err(ApiError::SessionExpired);
                }
                StatusCode::TOO_MANY_REQUESTS if !retried_rate_limit => {
                    retried_rate_limit = true;
                    tracing::debug!("429 on {path}, retrying once after fixed delay");
                    tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
                }
                StatusCode::TOO_MANY_REQUESTS => return Err(ApiError::RateLimited),
                StatusCode::FORBIDDEN => {
                    return Err(ApiError::Forbidden(extract_message(&response.body)));
                }
                status if status.is_server_error() => {
                    return Err(ApiError::Server {
                        status: status.as_u16(),
                        message: extract_message(&response.body),
                    });
                }
                status if status.is_success() => {
                    let envelope = serde_json::from_str::<Envelope<T>>(&response.body)?;
                    return envelope.into_data();
                }
                status => {
                    return Err(ApiError::Api(format!(
                        "Unexpected HTTP {}: {}",
                        status.as_u16(),
                        compact_text(&response.body)
                    )));
                }
            }
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: Option<String>,
    error: Option<String>,
}

fn extract_message(body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<MessageBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no details provided".to_string()
    } else {
        compact_text(trimmed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted transport and refresh fakes shared by wrapper-level tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::auth::{MemoryTokenStore, RefreshApi, TokenPair, TokenStore};
    use crate::util::unix_timestamp_now;

    /// Transport that pops pre-scripted responses and records each request.
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: StdMutex<VecDeque<HttpResponse>>,
        pub requests: StdMutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn push(&self, status: StatusCode, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(HttpResponse {
                    status,
                    body: body.to_string(),
                });
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn bearers(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.bearer.clone())
                .collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> ApiResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ApiError::Api("scripted transport exhausted".to_string()))
        }
    }

    /// Refresh endpoint fake handing out sequential tokens.
    #[derive(Default)]
    pub struct SequentialRefreshApi {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl RefreshApi for SequentialRefreshApi {
        async fn refresh(&self, _refresh_token: &str) -> ApiResult<TokenPair> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(fresh_pair(&format!("access-refreshed-{call}")))
        }
    }

    pub fn fresh_pair(access: &str) -> TokenPair {
        let now = unix_timestamp_now();
        TokenPair {
            access_token: access.to_string(),
            refresh_token: "refresh-1".to_string(),
            access_expires_at: now + 3600,
            refresh_expires_at: now + 86_400,
        }
    }

    /// Manager seeded with a valid pair and a sequential refresh fake.
    pub fn seeded_manager(access: &str) -> (Arc<TokenManager>, Arc<SequentialRefreshApi>) {
        let refresh_api = Arc::new(SequentialRefreshApi::default());
        let store = Arc::new(MemoryTokenStore::default());
        store.save(&fresh_pair(access)).unwrap();
        let manager = TokenManager::new(
            Arc::clone(&refresh_api) as Arc<dyn RefreshApi>,
            store,
        );
        manager.restore().unwrap();
        (Arc::new(manager), refresh_api)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::test_support::{seeded_manager, ScriptedTransport};
    use super::*;

    #[derive(Debug, Deserialize, PartialEq, Eq)]
    struct Profile {
        name: String,
    }

    fn client_with(transport: Arc<ScriptedTransport>) -> ApiClient {
        let (tokens, _) = seeded_manager("access-1");
        ApiClient::with_transport("https://api.fundi.app", transport, tokens).unwrap()
    }

    #[tokio::test]
    async fn success_envelope_decodes_data() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(
            StatusCode::OK,
            r#"{ "status": "success", "data": { "name": "Wanjiku" } }"#,
        );
        let client = client_with(Arc::clone(&transport));

        let profile: Profile = client.get("/v1/profile").await.unwrap();
        assert_eq!(
            profile,
            Profile {
                name: "Wanjiku".to_string()
            }
        );
        assert_eq!(transport.bearers(), vec!["access-1".to_string()]);
    }

    #[tokio::test]
    async fn error_envelope_on_http_200_is_a_soft_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(
            StatusCode::OK,
            r#"{ "status": "error", "message": "profile unavailable" }"#,
        );
        let client = client_with(transport);

        let error = client.get::<Profile>("/v1/profile").await.unwrap_err();
        assert!(matches!(error, ApiError::Api(message) if message == "profile unavailable"));
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_refresh_and_one_retry() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::UNAUTHORIZED, "");
        transport.push(
            StatusCode::OK,
            r#"{ "status": "success", "data": { "name": "Wanjiku" } }"#,
        );
        let (tokens, refresh_api) = seeded_manager("access-1");
        let client = ApiClient::with_transport(
            "https://api.fundi.app",
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
            tokens,
        )
        .unwrap();

        let profile: Profile = client.get("/v1/profile").await.unwrap();
        assert_eq!(profile.name, "Wanjiku");
        assert_eq!(refresh_api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.bearers(),
            vec!["access-1".to_string(), "access-refreshed-0".to_string()]
        );
    }

    #[tokio::test]
    async fn second_unauthorized_fails_as_session_expired_without_third_attempt() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::UNAUTHORIZED, "");
        transport.push(StatusCode::UNAUTHORIZED, "");
        let client = client_with(Arc::clone(&transport));

        let error = client.get::<Profile>("/v1/profile").await.unwrap_err();
        assert!(matches!(error, ApiError::SessionExpired));
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_once_after_fixed_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::TOO_MANY_REQUESTS, "");
        transport.push(
            StatusCode::OK,
            r#"{ "status": "success", "data": { "name": "Wanjiku" } }"#,
        );
        let client = client_with(Arc::clone(&transport));

        let started = tokio::time::Instant::now();
        let profile: Profile = client.get("/v1/profile").await.unwrap();
        assert_eq!(profile.name, "Wanjiku");
        assert_eq!(transport.request_count(), 2);
        assert!(started.elapsed() >= RATE_LIMIT_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn second_rate_limit_is_surfaced_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::TOO_MANY_REQUESTS, "");
        transport.push(StatusCode::TOO_MANY_REQUESTS, "");
        let client = client_with(Arc::clone(&transport));

        let error = client.get::<Profile>("/v1/profile").await.unwrap_err();
        assert!(matches!(error, ApiError::RateLimited));
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn forbidden_is_surfaced_with_backend_message_and_never_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(
            StatusCode::FORBIDDEN,
            r#"{ "status": "error", "message": "role mismatch" }"#,
        );
        let client = client_with(Arc::clone(&transport));

        let error = client.get::<Profile>("/v1/admin/stats").await.unwrap_err();
        assert!(matches!(error, ApiError::Forbidden(message) if message == "role mismatch"));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_classified_as_backend_faults() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::INTERNAL_SERVER_ERROR, "database timeout");
        let client = client_with(transport);

        let error = client.get::<Profile>("/v1/profile").await.unwrap_err();
        match error {
            ApiError::Server { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "database timeout");
            }
            other => panic!("expected server error, got {other:?}"),
        }
        assert!(error_is_expected(500));
    }

    fn error_is_expected(status: u16) -> bool {
        ApiError::Server {
            status,
            message: String::new(),
        }
        .is_expected()
    }
}
