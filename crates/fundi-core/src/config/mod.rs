//! Bootstrap configuration for the Fundi client apps.
//!
//! Both shells (customer and provider/admin) resolve the same two endpoints:
//! the API base URL for authenticated calls and the auth base URL for the
//! login/refresh routes. Secret credentials are never stored here.

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Build-provisioned client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Auth routes base. Defaults to `api_base_url` when absent.
    #[serde(default)]
    pub auth_base_url: Option<String>,
}

impl ClientConfig {
    /// Reads `FUNDI_API_BASE_URL` and optional `FUNDI_AUTH_BASE_URL`.
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("FUNDI_API_BASE_URL").ok(),
            auth_base_url: std::env::var("FUNDI_AUTH_BASE_URL").ok(),
        }
    }

    /// Returns the normalized API base URL, or an error when unset/invalid.
    pub fn api_base_url(&self) -> ApiResult<String> {
        let url = nonblank(self.api_base_url.as_deref()).ok_or_else(|| {
            ApiError::InvalidConfiguration("API base URL is not configured".to_string())
        })?;
        normalize_base_url(url)
    }

    /// Returns the normalized auth base URL, falling back to the API base.
    pub fn auth_base_url(&self) -> ApiResult<String> {
        match nonblank(self.auth_base_url.as_deref()) {
            Some(url) => normalize_base_url(url),
            None => self.api_base_url(),
        }
    }
}

fn nonblank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|trimmed| !trimmed.is_empty())
}

fn has_http_scheme(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Trim, validate the scheme, and strip any trailing slash from a base URL.
pub fn normalize_base_url(raw: &str) -> ApiResult<String> {
    let base = raw.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ApiError::InvalidConfiguration(
            "base URL must not be empty".to_string(),
        ));
    }
    if !has_http_scheme(base) {
        return Err(ApiError::InvalidConfiguration(
            "base URL must include http:// or https://".to_string(),
        ));
    }
    Ok(base.to_string())
}
